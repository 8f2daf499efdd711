fn main() -> anyhow::Result<()> {
    jobflow::run()
}
