use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
#[error("invalid id `{0}`: expected 40 hex characters")]
pub struct InvalidId(String);

macro_rules! hex_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name([u8; 20]);

        impl $name {
            /// A fresh id from 20 cryptographically random bytes.
            #[must_use]
            pub fn random() -> Self {
                Self(rand::random())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.pad(&hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = InvalidId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0; 20];
                hex::decode_to_slice(s, &mut bytes)
                    .map_err(|_| InvalidId(s.to_owned()))?;
                Ok(Self(bytes))
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidId;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                hex::encode(id.0)
            }
        }
    };
}

hex_id! {
    /// Identifies one logical client session across long-poll requests.
    SessionId
}

hex_id! {
    /// Identifies the browser owning one or more sessions, carried in a
    /// cookie and used to cap concurrent held connects.
    BrowserId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_as_40_hex_chars() {
        let id = SessionId::random();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 40);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(rendered.parse::<SessionId>(), Ok(id));
    }

    #[test]
    fn rejects_short_and_non_hex() {
        assert!("deadbeef".parse::<SessionId>().is_err());
        assert!("zz".repeat(20).parse::<SessionId>().is_err());
    }
}
