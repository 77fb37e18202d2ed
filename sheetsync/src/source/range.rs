use crate::error::{Result, SyncError};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::OnceLock;

/// A rectangular range in A1 notation: `Sheet1!A1:Z100`, `'My Sheet'!B2:F`,
/// `A2:C` or a single cell `B3`. Columns are zero-based internally, rows are
/// one-based as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRange {
    pub sheet: Option<String>,
    pub start_col: usize,
    pub start_row: usize,
    /// `None` for a single-cell range.
    pub end_col: Option<usize>,
    /// `None` means "through the last row".
    pub end_row: Option<usize>,
}

fn a1_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:(?:'(?P<quoted>[^']+)'|(?P<sheet>[^!']+))!)?(?P<c1>[A-Za-z]+)(?P<r1>\d+)(?::(?P<c2>[A-Za-z]+)(?P<r2>\d+)?)?$",
        )
        .expect("valid regex")
    })
}

impl SheetRange {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || SyncError::Config(format!("invalid A1 range '{input}'"));
        let caps = a1_regex().captures(input.trim()).ok_or_else(invalid)?;

        let sheet = caps
            .name("quoted")
            .or_else(|| caps.name("sheet"))
            .map(|m| m.as_str().to_string());
        let start_col = column_index(&caps["c1"]).ok_or_else(invalid)?;
        let start_row: usize = caps["r1"].parse().map_err(|_| invalid())?;
        let end_col = match caps.name("c2") {
            Some(m) => Some(column_index(m.as_str()).ok_or_else(invalid)?),
            None => None,
        };
        let end_row = match caps.name("r2") {
            Some(m) => Some(m.as_str().parse::<usize>().map_err(|_| invalid())?),
            None => None,
        };

        if start_row == 0 || end_row == Some(0) {
            return Err(invalid());
        }
        if end_col.is_some_and(|c| c < start_col) || end_row.is_some_and(|r| r < start_row) {
            return Err(SyncError::Config(format!(
                "range '{input}' ends before it starts"
            )));
        }

        Ok(SheetRange {
            sheet,
            start_col,
            start_row,
            end_col,
            end_row,
        })
    }

    fn is_single_cell(&self) -> bool {
        self.end_col.is_none()
    }

    /// Crop raw sheet values (row 1 at index 0) to this range.
    pub fn apply(&self, values: &[Vec<String>]) -> Vec<Vec<String>> {
        let (last_col, last_row) = if self.is_single_cell() {
            (Some(self.start_col), Some(self.start_row))
        } else {
            (self.end_col, self.end_row)
        };

        values
            .iter()
            .enumerate()
            .skip(self.start_row - 1)
            .take_while(|(i, _)| last_row.map_or(true, |r| i + 1 <= r))
            .map(|(_, row)| {
                let end = last_col.map_or(row.len(), |c| (c + 1).min(row.len()));
                if self.start_col >= end {
                    Vec::new()
                } else {
                    row[self.start_col..end].to_vec()
                }
            })
            .collect()
    }
}

impl fmt::Display for SheetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sheet) = &self.sheet {
            if sheet.contains(' ') {
                write!(f, "'{sheet}'!")?;
            } else {
                write!(f, "{sheet}!")?;
            }
        }
        write!(f, "{}{}", column_letters(self.start_col), self.start_row)?;
        if let Some(end_col) = self.end_col {
            write!(f, ":{}", column_letters(end_col))?;
            if let Some(end_row) = self.end_row {
                write!(f, "{end_row}")?;
            }
        }
        Ok(())
    }
}

impl Serialize for SheetRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SheetRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SheetRange::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// `A` -> 0, `Z` -> 25, `AA` -> 26.
pub fn column_index(letters: &str) -> Option<usize> {
    if letters.is_empty() {
        return None;
    }
    let mut index: usize = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        let digit = (c.to_ascii_uppercase() as u8 - b'A') as usize + 1;
        index = index.checked_mul(26)?.checked_add(digit)?;
    }
    Some(index - 1)
}

/// 0 -> `A`, 25 -> `Z`, 26 -> `AA`.
pub fn column_letters(index: usize) -> String {
    let mut n = index + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Vec<Vec<String>> {
        (1..=5)
            .map(|r| (0..4).map(|c| format!("{}{}", column_letters(c), r)).collect())
            .collect()
    }

    #[test]
    fn test_column_conversion() {
        assert_eq!(column_index("A"), Some(0));
        assert_eq!(column_index("z"), Some(25));
        assert_eq!(column_index("AA"), Some(26));
        assert_eq!(column_index("A1"), None);
        assert_eq!(column_letters(0), "A");
        assert_eq!(column_letters(27), "AB");
        assert_eq!(column_letters(701), "ZZ");
        assert_eq!(column_letters(702), "AAA");
    }

    #[test]
    fn test_parse_forms() {
        let r = SheetRange::parse("Sheet1!A1:Z100").unwrap();
        assert_eq!(r.sheet.as_deref(), Some("Sheet1"));
        assert_eq!((r.start_col, r.start_row, r.end_col, r.end_row), (0, 1, Some(25), Some(100)));

        let r = SheetRange::parse("'My Sheet'!B2:F").unwrap();
        assert_eq!(r.sheet.as_deref(), Some("My Sheet"));
        assert_eq!(r.end_row, None);
        assert_eq!(r.to_string(), "'My Sheet'!B2:F");

        assert_eq!(SheetRange::parse("B3").unwrap().to_string(), "B3");
    }

    #[test]
    fn test_parse_rejects() {
        assert!(SheetRange::parse("A0:B2").is_err());
        assert!(SheetRange::parse("C1:A2").is_err());
        assert!(SheetRange::parse("A3:B1").is_err());
        assert!(SheetRange::parse("1A").is_err());
        assert!(SheetRange::parse("").is_err());
    }

    #[test]
    fn test_apply_crops() {
        let cropped = SheetRange::parse("B2:C3").unwrap().apply(&grid());
        assert_eq!(
            cropped,
            vec![vec!["B2".to_string(), "C2".to_string()], vec!["B3".to_string(), "C3".to_string()]]
        );

        let open = SheetRange::parse("C4:Z").unwrap().apply(&grid());
        assert_eq!(open.len(), 2);
        assert_eq!(open[1], vec!["C5".to_string(), "D5".to_string()]);

        let cell = SheetRange::parse("D1").unwrap().apply(&grid());
        assert_eq!(cell, vec![vec!["D1".to_string()]]);
    }

    #[test]
    fn test_serde_as_string() {
        let r: SheetRange = serde_yaml::from_str("\"A1:F\"").unwrap();
        assert_eq!(r.end_col, Some(5));
        assert_eq!(serde_json::to_string(&r).unwrap(), "\"A1:F\"");
    }
}
