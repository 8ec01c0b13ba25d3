//! Version constraints over semver versions, plus the dependency, conflict
//! and obsoletion records manifests declare with them.

use semver::Version;
use serde::{Deserialize, Serialize};

/// A single predicate over a version. Dependencies hold a conjunction of
/// these, conflicts a disjunction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
	pub op: ConstraintOp,
	#[serde(default = "zero_version", skip_serializing_if = "is_zero_version")]
	pub version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOp {
	#[serde(rename = "*")]
	Any,
	#[serde(rename = "=")]
	Eq,
	#[serde(rename = "!=")]
	Ne,
	#[serde(rename = ">")]
	Gt,
	#[serde(rename = ">=")]
	Ge,
	#[serde(rename = "<")]
	Lt,
	#[serde(rename = "<=")]
	Le,
	#[serde(rename = "^")]
	Compatible,
}

fn zero_version() -> Version {
	Version::new(0, 0, 0)
}

fn is_zero_version(v: &Version) -> bool {
	*v == zero_version()
}

impl Constraint {
	pub fn any() -> Self {
		Self {
			op: ConstraintOp::Any,
			version: zero_version(),
		}
	}

	pub fn new(op: ConstraintOp, version: Version) -> Self {
		Self { op, version }
	}

	/// Pure predicate check. The caret rule follows cargo: same major, and
	/// below major 1 the leftmost nonzero component is the breaking one.
	pub fn satisfies(&self, other: &Version) -> bool {
		let v = &self.version;
		match self.op {
			ConstraintOp::Any => true,
			ConstraintOp::Eq => other == v,
			ConstraintOp::Ne => other != v,
			ConstraintOp::Gt => other > v,
			ConstraintOp::Ge => other >= v,
			ConstraintOp::Lt => other < v,
			ConstraintOp::Le => other <= v,
			ConstraintOp::Compatible => {
				if other.major != v.major {
					return false;
				}
				if v.major > 0 {
					return other >= v;
				}
				if v.minor > 0 {
					return other.minor == v.minor && other >= v;
				}
				other.patch == v.patch
			}
		}
	}
}

impl std::fmt::Display for Constraint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self.op {
			ConstraintOp::Any => write!(f, "*"),
			ConstraintOp::Eq => write!(f, "={}", self.version),
			ConstraintOp::Ne => write!(f, "!={}", self.version),
			ConstraintOp::Gt => write!(f, ">{}", self.version),
			ConstraintOp::Ge => write!(f, ">={}", self.version),
			ConstraintOp::Lt => write!(f, "<{}", self.version),
			ConstraintOp::Le => write!(f, "<={}", self.version),
			ConstraintOp::Compatible => write!(f, "^{}", self.version),
		}
	}
}

/// A requirement on another extension. All constraints must hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
	pub name: String,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub optional: bool,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub constraints: Vec<Constraint>,
}

impl Dependency {
	pub fn satisfied_by(&self, version: &Version) -> bool {
		self.constraints.iter().all(|c| c.satisfies(version))
	}
}

/// A refusal to coexist with another extension. Any matching constraint
/// triggers it; an empty list matches every version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub constraints: Vec<Constraint>,
}

impl Conflict {
	pub fn triggered_by(&self, version: &Version) -> bool {
		if self.constraints.is_empty() {
			return true;
		}
		self.constraints.iter().any(|c| c.satisfies(version))
	}
}

/// Declares that this extension supersedes another one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obsolete {
	pub name: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub constraints: Vec<Constraint>,
}

impl Obsolete {
	pub fn covers(&self, version: &Version) -> bool {
		if self.constraints.is_empty() {
			return true;
		}
		self.constraints.iter().any(|c| c.satisfies(version))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn v(s: &str) -> Version {
		Version::parse(s).unwrap()
	}

	#[test]
	fn test_relational_ops() {
		let c = Constraint::new(ConstraintOp::Ge, v("1.2.0"));
		assert!(c.satisfies(&v("1.2.0")));
		assert!(c.satisfies(&v("2.0.0")));
		assert!(!c.satisfies(&v("1.1.9")));

		let c = Constraint::new(ConstraintOp::Ne, v("1.0.0"));
		assert!(!c.satisfies(&v("1.0.0")));
		assert!(c.satisfies(&v("1.0.1")));

		assert!(Constraint::any().satisfies(&v("0.0.1")));
	}

	#[test]
	fn test_caret_major() {
		let c = Constraint::new(ConstraintOp::Compatible, v("2.1.0"));
		assert!(c.satisfies(&v("2.1.0")));
		assert!(c.satisfies(&v("2.9.3")));
		assert!(!c.satisfies(&v("2.0.9")));
		assert!(!c.satisfies(&v("3.0.0")));
		assert!(!c.satisfies(&v("1.9.9")));
	}

	#[test]
	fn test_caret_zero_major() {
		// ^0.2.3 := >=0.2.3 <0.3.0
		let c = Constraint::new(ConstraintOp::Compatible, v("0.2.3"));
		assert!(c.satisfies(&v("0.2.3")));
		assert!(c.satisfies(&v("0.2.9")));
		assert!(!c.satisfies(&v("0.2.2")));
		assert!(!c.satisfies(&v("0.3.0")));

		// ^0.0.3 := exactly 0.0.3
		let c = Constraint::new(ConstraintOp::Compatible, v("0.0.3"));
		assert!(c.satisfies(&v("0.0.3")));
		assert!(!c.satisfies(&v("0.0.4")));
		assert!(!c.satisfies(&v("0.1.0")));
	}

	#[test]
	fn test_satisfies_is_pure() {
		let c = Constraint::new(ConstraintOp::Compatible, v("1.4.0"));
		let u = v("1.5.2");
		let first = c.satisfies(&u);
		for _ in 0..8 {
			assert_eq!(c.satisfies(&u), first);
		}
	}

	#[test]
	fn test_dependency_conjunction() {
		let dep = Dependency {
			name: "core".into(),
			constraints: vec![
				Constraint::new(ConstraintOp::Ge, v("1.2.0")),
				Constraint::new(ConstraintOp::Lt, v("2.0.0")),
			],
			optional: false,
		};
		assert!(dep.satisfied_by(&v("1.5.0")));
		assert!(!dep.satisfied_by(&v("2.0.0")));
		assert!(!dep.satisfied_by(&v("1.1.0")));
	}

	#[test]
	fn test_conflict_disjunction() {
		let conflict = Conflict {
			name: "old".into(),
			constraints: vec![
				Constraint::new(ConstraintOp::Lt, v("1.0.0")),
				Constraint::new(ConstraintOp::Eq, v("1.3.0")),
			],
			reason: None,
		};
		assert!(conflict.triggered_by(&v("0.9.0")));
		assert!(conflict.triggered_by(&v("1.3.0")));
		assert!(!conflict.triggered_by(&v("1.1.0")));

		let all = Conflict { name: "any".into(), constraints: vec![], reason: None };
		assert!(all.triggered_by(&v("4.5.6")));
	}
}
