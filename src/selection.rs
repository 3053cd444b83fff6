//! Parses the `-t/--targets` selection filter (spec.md §4.6): a single
//! integer, a comma-separated list, a colon- or dash-delimited inclusive
//! range, and any union of the above. Parsing is strict — any unparsable
//! fragment is rejected before a single case is dispatched.

use std::collections::BTreeSet;

use crate::error::UkError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionFilter {
    indices: BTreeSet<usize>,
}

impl SelectionFilter {
    /// A filter matching every case; used when `-t` is not supplied.
    pub fn all() -> Self {
        SelectionFilter {
            indices: BTreeSet::new(),
        }
    }

    pub fn contains(&self, index: usize, total: usize) -> bool {
        if self.indices.is_empty() {
            index >= 1 && index <= total
        } else {
            self.indices.contains(&index)
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UkError> {
        let mut indices = BTreeSet::new();
        for fragment in raw.split(',') {
            let fragment = fragment.trim();
            if fragment.is_empty() {
                return Err(UkError::Usage(format!(
                    "empty selection fragment in '{raw}'"
                )));
            }
            if let Some((lo, hi)) = split_range(fragment, ':').or_else(|| split_range(fragment, '-')) {
                let lo: usize = lo.parse().map_err(|_| {
                    UkError::Usage(format!("invalid range start '{lo}' in '{fragment}'"))
                })?;
                let hi: usize = hi.parse().map_err(|_| {
                    UkError::Usage(format!("invalid range end '{hi}' in '{fragment}'"))
                })?;
                if lo == 0 || hi == 0 || lo > hi {
                    return Err(UkError::Usage(format!(
                        "invalid inclusive range '{fragment}'"
                    )));
                }
                indices.extend(lo..=hi);
            } else {
                let value: usize = fragment.parse().map_err(|_| {
                    UkError::Usage(format!("invalid selection index '{fragment}'"))
                })?;
                if value == 0 {
                    return Err(UkError::Usage(
                        "selection indices are 1-based; 0 is invalid".to_string(),
                    ));
                }
                indices.insert(value);
            }
        }
        Ok(SelectionFilter { indices })
    }

    pub fn selected(&self, total: usize) -> Vec<usize> {
        (1..=total).filter(|i| self.contains(*i, total)).collect()
    }
}

fn split_range(fragment: &str, delim: char) -> Option<(&str, &str)> {
    let mut parts = fragment.splitn(2, delim);
    let lo = parts.next()?;
    let hi = parts.next()?;
    if hi.is_empty() || lo.is_empty() {
        None
    } else {
        Some((lo, hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S4 from spec.md §8: `1,3:5,7` over N=10 dispatches {1,3,4,5,7}.
    #[test]
    fn s4_selection_filter() {
        let filter = SelectionFilter::parse("1,3:5,7").unwrap();
        assert_eq!(filter.selected(10), vec![1, 3, 4, 5, 7]);
    }

    #[test]
    fn dash_delimited_range() {
        let filter = SelectionFilter::parse("2-4").unwrap();
        assert_eq!(filter.selected(10), vec![2, 3, 4]);
    }

    #[test]
    fn all_selects_every_case() {
        let filter = SelectionFilter::all();
        assert_eq!(filter.selected(3), vec![1, 2, 3]);
    }

    #[test]
    fn unparsable_fragment_is_rejected() {
        assert!(SelectionFilter::parse("1,,3").is_err());
        assert!(SelectionFilter::parse("abc").is_err());
        assert!(SelectionFilter::parse("5:2").is_err());
        assert!(SelectionFilter::parse("0").is_err());
    }
}
