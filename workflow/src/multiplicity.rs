use std::collections::BTreeMap;

use anyhow::Result;

use crate::Error;

/// Nesting order given to single-valued records, which are broadcast to every element.
pub const BROADCAST: f64 = -1.0;

/// How many values one path contributes to an element set, and how it combines with others.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiplicityRecord {
    pub path: String,
    pub multiplicity: usize,
    pub nesting_order: f64,
}

impl MultiplicityRecord {
    pub fn new(path: impl Into<String>, multiplicity: usize, nesting_order: f64) -> Self {
        Self {
            path: path.into(),
            multiplicity,
            nesting_order,
        }
    }

    pub fn broadcast(path: impl Into<String>) -> Self {
        Self::new(path, 1, BROADCAST)
    }
}

struct Group<'a> {
    order: f64,
    multiplicity: usize,
    paths: Vec<&'a str>,
}

/// Expand multiplicity records into one `path -> value index` map per new element.
///
/// Records sharing a nesting order vary together and must have equal multiplicities.
/// Distinct orders are combined by cross-product in ascending order, with lower
/// orders varying slower. The result has `product(group multiplicities)` entries.
pub fn resolve_multiplicities(records: &[MultiplicityRecord]) -> Result<Vec<BTreeMap<String, usize>>> {
    let mut groups: Vec<Group> = Vec::with_capacity(records.len());
    for rec in records {
        if rec.nesting_order < 0.0 && rec.multiplicity != 1 {
            return Err(Error::TaskTemplateInvalidNesting {
                path: rec.path.clone(),
                order: rec.nesting_order,
            }
            .into());
        }
        match groups.iter().position(|g| g.order == rec.nesting_order) {
            Some(i) if groups[i].multiplicity != rec.multiplicity => {
                return Err(Error::InconsistentMultiplicity {
                    order: rec.nesting_order,
                    path: rec.path.clone(),
                    found: rec.multiplicity,
                    expected: groups[i].multiplicity,
                }
                .into());
            }
            Some(i) => groups[i].paths.push(rec.path.as_str()),
            None => groups.push(Group {
                order: rec.nesting_order,
                multiplicity: rec.multiplicity,
                paths: vec![rec.path.as_str()],
            }),
        }
    }
    groups.sort_by(|a, b| a.order.total_cmp(&b.order));

    let total: usize = groups.iter().map(|g| g.multiplicity).product();
    log::trace!(
        "resolving {} multiplicity records in {} groups into {total} elements",
        records.len(),
        groups.len(),
    );

    let mut elements = Vec::with_capacity(total);
    for n in 0..total {
        let mut element = BTreeMap::new();
        let mut rem = n;
        // last group varies fastest:
        for group in groups.iter().rev() {
            let idx = rem % group.multiplicity;
            rem /= group.multiplicity;
            for path in &group.paths {
                element.insert((*path).to_owned(), idx);
            }
        }
        elements.push(element);
    }
    Ok(elements)
}
