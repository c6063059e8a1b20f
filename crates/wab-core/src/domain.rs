use std::fmt;

/// Domain suffix for one-to-one user addresses on the network.
pub const USER_DOMAIN: &str = "s.whatsapp.net";

/// Network address of a chat participant (`<user>@<domain>`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Jid(pub String);

impl Jid {
    /// Build a user address from a phone-number-like string.
    ///
    /// Every non-digit character is stripped before the domain suffix is appended.
    pub fn from_phone(raw: &str) -> Self {
        Self(format!("{}@{USER_DOMAIN}", digits_only(raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}
