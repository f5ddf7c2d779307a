//! String forms for config values that have no serde impl of their own:
//! tracing levels (`"debug"`) and humantime durations (`"5s"`, `"1m 30s"`).

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

fn parse<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let raw = String::deserialize(deserializer)?;
    raw.trim().parse().map_err(D::Error::custom)
}

fn parse_opt<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => raw.trim().parse().map(Some).map_err(D::Error::custom),
        None => Ok(None),
    }
}

pub mod level {
    use tracing::Level;

    use super::*;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(level.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        parse(deserializer)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            level: &Option<Level>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match level {
                Some(level) => super::serialize(level, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Level>, D::Error> {
            parse_opt(deserializer)
        }
    }
}

pub mod duration {
    use std::time::Duration;

    use humantime::Duration as Human;

    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        parse::<D, Human>(deserializer).map(Into::into)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            parse_opt::<D, Human>(deserializer).map(|value| value.map(Into::into))
        }
    }
}
