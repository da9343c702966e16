use super::structs::ExtraMount;

use serde::Deserialize;
use std::{
    fmt::{self, Display},
    str::FromStr,
};

impl ExtraMount {
    pub fn optional(path: &str) -> Self {
        ExtraMount {
            path: path.to_string(),
            required: false,
        }
    }

    pub fn required(path: &str) -> Self {
        ExtraMount {
            path: path.to_string(),
            required: true,
        }
    }
}

impl Display for ExtraMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.required {
            write!(f, "{}!", self.path)
        } else {
            write!(f, "{}", self.path)
        }
    }
}

/// `path` for an optional mount, `path!` for a required one.
impl FromStr for ExtraMount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (path, required) = match s.strip_suffix('!') {
            Some(path) => (path, true),
            None => (s, false),
        };
        if path.is_empty() {
            return Err(format!("Invalid mount: '{}'", s));
        }
        Ok(ExtraMount {
            path: path.to_string(),
            required,
        })
    }
}

pub(crate) fn deserialize_level_filter<'de, D>(
    deserializer: D,
) -> Result<Option<log::LevelFilter>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    s.map_or(Ok(None), |s| {
        log::LevelFilter::from_str(&s)
            .map(Some)
            .map_err(serde::de::Error::custom)
    })
}
