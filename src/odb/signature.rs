//! Author/committer signatures: the `name <email> timestamp offset` lines
//! found in commit objects and in the fast-import command grammar.

use std::fmt::Display;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::StrataError;

/// Whether a signature line is an `author` or a `committer` line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureType {
    Author,
    Committer,
}

impl SignatureType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SignatureType::Author => "author",
            SignatureType::Committer => "committer",
        }
    }

    pub fn from_str(s: &str) -> Result<SignatureType, StrataError> {
        match s {
            "author" => Ok(SignatureType::Author),
            "committer" => Ok(SignatureType::Committer),
            _ => Err(StrataError::InvalidArgument(format!(
                "`{s}` is not a valid signature type"
            ))),
        }
    }
}

/// One signature: who, when, and in which timezone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub signature_type: SignatureType,
    pub name: String,
    pub email: String,
    /// Seconds since the epoch.
    pub timestamp: i64,
    /// Timezone offset formatted like `+1300`.
    pub timezone: String,
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} <{}> {} {}",
            self.name, self.email, self.timestamp, self.timezone
        )
    }
}

impl Signature {
    pub fn new(signature_type: SignatureType, name: &str, email: &str) -> Signature {
        Signature {
            signature_type,
            name: name.to_string(),
            email: email.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            timezone: "+0000".to_string(),
        }
    }

    /// Parse a signature line like
    /// `author Pam <pam@example.com> 1714264800 +1300`.
    pub fn from_data(data: &[u8]) -> Result<Signature, StrataError> {
        let invalid =
            || StrataError::InvalidArgument(format!("Invalid signature line: {:?}", data.as_bstr()));

        let sig_end = data.find_byte(b' ').ok_or_else(invalid)?;
        let signature_type =
            SignatureType::from_str(data[..sig_end].to_str().map_err(|_| invalid())?)?;

        let email_start = data.find_byte(b'<').ok_or_else(invalid)?;
        let email_end = data.find_byte(b'>').ok_or_else(invalid)?;
        if email_start < sig_end + 1 || email_end < email_start {
            return Err(invalid());
        }
        let name = data[sig_end + 1..email_start]
            .trim_ascii()
            .to_str()
            .map_err(|_| invalid())?
            .to_string();
        let email = data[email_start + 1..email_end]
            .to_str()
            .map_err(|_| invalid())?
            .to_string();

        let rest = data[email_end + 1..].trim_ascii();
        let mut parts = rest.splitn_str(2, " ");
        let timestamp: i64 = parts
            .next()
            .and_then(|p| p.to_str().ok())
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let timezone = parts
            .next()
            .and_then(|p| p.to_str().ok())
            .unwrap_or("+0000")
            .to_string();

        Ok(Signature {
            signature_type,
            name,
            email,
            timestamp,
            timezone,
        })
    }

    /// Serialize back to the signature line (without a trailing newline).
    pub fn to_data(&self) -> Result<Vec<u8>, StrataError> {
        Ok(format!(
            "{} {} <{}> {} {}",
            self.signature_type.as_str(),
            self.name,
            self.email,
            self.timestamp,
            self.timezone
        )
        .into_bytes())
    }
}
