use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("migration discovery error: {0}")]
    Discovery(String),

    #[error("database unreachable after {attempts} attempt(s): {last_error}")]
    Connectivity { attempts: u32, last_error: String },

    #[error("migration {name} failed: {cause}")]
    Application { name: String, cause: String },

    #[error("record store error: {0}")]
    RecordStore(String),

    #[error(
        "migration {name} was modified after it was applied (recorded checksum {recorded}, current {current})"
    )]
    ChecksumMismatch {
        name: String,
        recorded: String,
        current: String,
    },

    #[error("migration lock error: {0}")]
    Lock(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Process exit code reported for this error. Never zero.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Discovery(_) => 2,
            Error::Connectivity { .. } => 3,
            Error::Application { .. } => 4,
            Error::RecordStore(_) => 5,
            Error::ChecksumMismatch { .. } => 6,
            Error::Lock(_) => 7,
            Error::Config(_) => 8,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn error_display_includes_context() {
        let e = Error::Discovery("migrations: no such directory".into());
        assert_eq!(
            e.to_string(),
            "migration discovery error: migrations: no such directory"
        );

        let e = Error::Application {
            name: "002-add-flows".into(),
            cause: "no such table: bots".into(),
        };
        assert_eq!(
            e.to_string(),
            "migration 002-add-flows failed: no such table: bots"
        );

        let e = Error::Connectivity {
            attempts: 3,
            last_error: "unable to open database file".into(),
        };
        assert_eq!(
            e.to_string(),
            "database unreachable after 3 attempt(s): unable to open database file"
        );

        let e = Error::Other("misc".into());
        assert_eq!(e.to_string(), "misc");
    }

    #[test]
    fn exit_codes_are_distinct_and_non_zero() {
        let errors = [
            Error::Discovery(String::new()),
            Error::Connectivity {
                attempts: 1,
                last_error: String::new(),
            },
            Error::Application {
                name: String::new(),
                cause: String::new(),
            },
            Error::RecordStore(String::new()),
            Error::ChecksumMismatch {
                name: String::new(),
                recorded: String::new(),
                current: String::new(),
            },
            Error::Lock(String::new()),
            Error::Config(String::new()),
            Error::Other(String::new()),
        ];

        let mut codes: Vec<u8> = errors.iter().map(Error::exit_code).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
