use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Compares two `[epoch:]version[-release]` strings the way pacman does.
pub fn vercmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let (epoch1, ver1, rel1) = split_evr(a);
    let (epoch2, ver2, rel2) = split_evr(b);

    match segment_cmp(epoch1, epoch2) {
        Ordering::Equal => {}
        other => return other,
    }
    match segment_cmp(ver1, ver2) {
        Ordering::Equal => {}
        other => return other,
    }
    match (rel1, rel2) {
        (Some(r1), Some(r2)) => segment_cmp(r1, r2),
        _ => Ordering::Equal,
    }
}

fn split_evr(evr: &str) -> (&str, &str, Option<&str>) {
    let digits = evr.bytes().take_while(u8::is_ascii_digit).count();
    let (epoch, rest) = if evr.as_bytes().get(digits) == Some(&b':') {
        (&evr[..digits], &evr[digits + 1..])
    } else {
        ("0", evr)
    };
    match rest.rfind('-') {
        Some(pos) => (epoch, &rest[..pos], Some(&rest[pos + 1..])),
        None => (epoch, rest, None),
    }
}

fn segment_cmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let one = a.as_bytes();
    let two = b.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);

    while i < one.len() && j < two.len() {
        let (sep_start1, sep_start2) = (i, j);
        while i < one.len() && !one[i].is_ascii_alphanumeric() {
            i += 1;
        }
        while j < two.len() && !two[j].is_ascii_alphanumeric() {
            j += 1;
        }
        if i >= one.len() || j >= two.len() {
            break;
        }

        let sep1 = i - sep_start1;
        let sep2 = j - sep_start2;
        if sep1 != sep2 {
            return sep1.cmp(&sep2);
        }

        let (seg_start1, seg_start2) = (i, j);
        let numeric = one[i].is_ascii_digit();
        if numeric {
            while i < one.len() && one[i].is_ascii_digit() {
                i += 1;
            }
            while j < two.len() && two[j].is_ascii_digit() {
                j += 1;
            }
        } else {
            while i < one.len() && one[i].is_ascii_alphabetic() {
                i += 1;
            }
            while j < two.len() && two[j].is_ascii_alphabetic() {
                j += 1;
            }
        }

        let seg1 = &one[seg_start1..i];
        let seg2 = &two[seg_start2..j];

        // numeric segments are newer than alpha ones
        if seg2.is_empty() {
            return if numeric {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let ordering = if numeric {
            let trimmed1 = trim_leading_zeros(seg1);
            let trimmed2 = trim_leading_zeros(seg2);
            trimmed1
                .len()
                .cmp(&trimmed2.len())
                .then_with(|| trimmed1.cmp(trimmed2))
        } else {
            seg1.cmp(seg2)
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    let rest1 = &one[i.min(one.len())..];
    let rest2 = &two[j.min(two.len())..];
    if rest1.is_empty() && rest2.is_empty() {
        return Ordering::Equal;
    }

    // "1.0" < "1.0.1" but "1.0alpha" < "1.0"
    let first1 = rest1.first().copied();
    let first2 = rest2.first().copied();
    if (first1.is_none() && !first2.is_some_and(|c| c.is_ascii_alphabetic()))
        || first1.is_some_and(|c| c.is_ascii_alphabetic())
    {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

fn trim_leading_zeros(segment: &[u8]) -> &[u8] {
    let zeros = segment.iter().take_while(|&&c| c == b'0').count();
    &segment[zeros..]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepOp {
    Any,
    Eq,
    Ge,
    Le,
    Gt,
    Lt,
}

impl DepOp {
    fn symbol(self) -> &'static str {
        match self {
            DepOp::Any => "",
            DepOp::Eq => "=",
            DepOp::Ge => ">=",
            DepOp::Le => "<=",
            DepOp::Gt => ">",
            DepOp::Lt => "<",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepSpec {
    pub name: String,
    pub op: DepOp,
    pub version: Option<String>,
}

impl DepSpec {
    pub fn parse(input: &str) -> Self {
        // optdepends carry a trailing ": description"
        let input = input.split(": ").next().unwrap_or(input).trim();

        for (symbol, op) in [
            (">=", DepOp::Ge),
            ("<=", DepOp::Le),
            ("=", DepOp::Eq),
            (">", DepOp::Gt),
            ("<", DepOp::Lt),
        ] {
            if let Some(pos) = input.find(symbol) {
                return Self {
                    name: input[..pos].trim().to_string(),
                    op,
                    version: Some(input[pos + symbol.len()..].trim().to_string()),
                };
            }
        }

        Self {
            name: input.to_string(),
            op: DepOp::Any,
            version: None,
        }
    }

    pub fn version_matches(&self, candidate: &str) -> bool {
        let Some(required) = self.version.as_deref() else {
            return true;
        };
        // "foo=1.0" also matches "1.0-3" when the requirement has no release
        let candidate = if !required.contains('-') {
            candidate.rsplit_once('-').map_or(candidate, |(v, _)| v)
        } else {
            candidate
        };
        let ordering = vercmp(candidate, required);
        match self.op {
            DepOp::Any => true,
            DepOp::Eq => ordering == Ordering::Equal,
            DepOp::Ge => ordering != Ordering::Less,
            DepOp::Le => ordering != Ordering::Greater,
            DepOp::Gt => ordering == Ordering::Greater,
            DepOp::Lt => ordering == Ordering::Less,
        }
    }

    pub fn satisfied_by(&self, name: &str, version: &str, provides: &[String]) -> bool {
        if name == self.name && self.version_matches(version) {
            return true;
        }
        provides.iter().any(|provision| {
            let provision = DepSpec::parse(provision);
            if provision.name != self.name {
                return false;
            }
            match provision.version.as_deref() {
                Some(provided) => self.version_matches(provided),
                None => self.op == DepOp::Any,
            }
        })
    }
}

impl fmt::Display for DepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}{}{}", self.name, self.op.symbol(), version),
            None => write!(f, "{}", self.name),
        }
    }
}
