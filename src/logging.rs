//! Logging collaborator surface. The engine itself logs through the `log`
//! facade; extensions log through a [`Logger`] via their provider, and the
//! default sink funnels those into the same facade.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
	None = 0,
	Fatal = 1,
	Error = 2,
	Warning = 3,
	Info = 4,
	Debug = 5,
	Verbose = 6,
}

impl Severity {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Fatal => "Fatal",
			Self::Error => "Error",
			Self::Warning => "Warning",
			Self::Info => "Info",
			Self::Debug => "Debug",
			Self::Verbose => "Verbose",
			Self::None => "None",
		}
	}

	pub fn from_str(s: &str) -> Self {
		match s {
			"Fatal" => Self::Fatal,
			"Error" => Self::Error,
			"Warning" => Self::Warning,
			"Info" => Self::Info,
			"Debug" => Self::Debug,
			"Verbose" => Self::Verbose,
			_ => Self::None,
		}
	}
}

pub trait Logger: Send + Sync {
	fn log(&self, msg: &str, severity: Severity);
}

/// Forwards extension messages into the `log` facade, so whatever the host
/// configured (env_logger in the tests) sees them too.
#[derive(Debug, Default)]
pub struct StdLogger;
impl Logger for StdLogger {
	fn log(&self, msg: &str, severity: Severity) {
		match severity {
			Severity::Fatal | Severity::Error => error!("{}", msg),
			Severity::Warning => warn!("{}", msg),
			Severity::Info => info!("{}", msg),
			Severity::Debug => debug!("{}", msg),
			Severity::Verbose => trace!("{}", msg),
			Severity::None => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_severity_strings() {
		for s in [
			Severity::None,
			Severity::Fatal,
			Severity::Error,
			Severity::Warning,
			Severity::Info,
			Severity::Debug,
			Severity::Verbose,
		] {
			assert_eq!(Severity::from_str(s.as_str()), s);
		}
		assert_eq!(Severity::from_str("garbage"), Severity::None);
	}

	#[test]
	fn test_severity_ordering() {
		assert!(Severity::Fatal < Severity::Warning);
		assert!(Severity::Info < Severity::Verbose);
	}
}
