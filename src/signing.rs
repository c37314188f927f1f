//! HMAC-signed machine links.
//!
//! A link identifies a dispensing machine and carries an HMAC-SHA256 tag over
//! the machine id. Permanent links (printed stickers) sign the bare id and never
//! expire. Ephemeral links (rotating on-screen codes) sign `"{id}.{ts}"` and are
//! only accepted within a TTL of `ts`. The presence of `ts` alone decides which
//! mode a link is verified under.

use std::fmt;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

/// Default validity window of an ephemeral link: 10 minutes.
pub const DEFAULT_TTL_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    Permanent,
    Ephemeral,
}

impl LinkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkMode::Permanent => "permanent",
            LinkMode::Ephemeral => "ephemeral",
        }
    }
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a link failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkFailure {
    #[error("missing_params")]
    MissingParams,
    #[error("expired")]
    Expired,
    #[error("bad_sig")]
    BadSig,
}

/// Output of [`sign`]: a hex tag, plus the timestamp for ephemeral links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub sig: String,
    pub ts: Option<i64>,
}

fn hmac_hex(input: &str, secret: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(input.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn ephemeral_input(machine_id: &str, ts: i64) -> String {
    format!("{machine_id}.{ts}")
}

/// Signs a machine id. Ephemeral links default `ts` to the current time in
/// epoch milliseconds; permanent links ignore `ts`.
pub fn sign(machine_id: &str, mode: LinkMode, secret: &[u8], ts: Option<i64>) -> Signature {
    match mode {
        LinkMode::Permanent => Signature {
            sig: hmac_hex(machine_id, secret),
            ts: None,
        },
        LinkMode::Ephemeral => {
            let ts = ts.unwrap_or_else(|| Utc::now().timestamp_millis());
            Signature {
                sig: hmac_hex(&ephemeral_input(machine_id, ts), secret),
                ts: Some(ts),
            }
        }
    }
}

/// Verifies a link tag. `now` and `ts` are epoch milliseconds.
pub fn verify(
    machine_id: &str,
    sig: &str,
    secret: &[u8],
    ts: Option<i64>,
    now: i64,
    ttl_ms: i64,
) -> Result<LinkMode, LinkFailure> {
    if machine_id.is_empty() || sig.is_empty() {
        return Err(LinkFailure::MissingParams);
    }

    match ts {
        Some(ts) => {
            let age = now.checked_sub(ts).ok_or(LinkFailure::Expired)?;
            if age < 0 || age > ttl_ms {
                return Err(LinkFailure::Expired);
            }
            let expected = hmac_hex(&ephemeral_input(machine_id, ts), secret);
            if safe_equal_hex(&expected, sig) {
                Ok(LinkMode::Ephemeral)
            } else {
                Err(LinkFailure::BadSig)
            }
        }
        None => {
            let expected = hmac_hex(machine_id, secret);
            if safe_equal_hex(&expected, sig) {
                Ok(LinkMode::Permanent)
            } else {
                Err(LinkFailure::BadSig)
            }
        }
    }
}

/// Constant-time comparison of two hex strings.
///
/// Non-hex input or a length mismatch compares unequal without touching the
/// bytes; only the length is observable through timing.
fn safe_equal_hex(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    match (hex::decode(a), hex::decode(b)) {
        (Ok(a), Ok(b)) => a.ct_eq(&b).into(),
        _ => false,
    }
}

/// The query-string form of a link: `?m=<machineId>&sig=<hex>[&ts=<epoch-ms>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedLink {
    pub machine_id: String,
    pub sig: String,
    /// Raw timestamp as received; empty values are treated as absent.
    pub ts: Option<String>,
}

impl SignedLink {
    pub fn new(machine_id: impl Into<String>, signature: Signature) -> Self {
        Self {
            machine_id: machine_id.into(),
            sig: signature.sig,
            ts: signature.ts.map(|ts| ts.to_string()),
        }
    }

    /// Reads `m`, `sig` and `ts` from a query string (leading `?` optional).
    /// Values are trimmed; unknown keys are ignored.
    pub fn from_query(query: &str) -> Self {
        let mut link = SignedLink {
            machine_id: String::new(),
            sig: String::new(),
            ts: None,
        };
        let query = query.strip_prefix('?').unwrap_or(query);
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let value = value.trim();
            match key.as_ref() {
                "m" => link.machine_id = value.to_string(),
                "sig" => link.sig = value.to_string(),
                "ts" if !value.is_empty() => link.ts = Some(value.to_string()),
                _ => {}
            }
        }
        link
    }

    pub fn to_query(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("m", &self.machine_id);
        query.append_pair("sig", &self.sig);
        if let Some(ts) = &self.ts {
            query.append_pair("ts", ts);
        }
        query.finish()
    }

    /// Front-end URL the QR code points at.
    pub fn deep_url(&self, base_url: &str) -> String {
        format!(
            "{}/qr-resolver?{}",
            base_url.trim_end_matches('/'),
            self.to_query()
        )
    }

    pub fn mode(&self) -> LinkMode {
        if self.ts.is_some() {
            LinkMode::Ephemeral
        } else {
            LinkMode::Permanent
        }
    }

    /// Verifies this link. A timestamp that is not an integer can never be
    /// inside the validity window and is reported as expired.
    pub fn verify(&self, secret: &[u8], now: i64, ttl_ms: i64) -> Result<LinkMode, LinkFailure> {
        if self.machine_id.is_empty() || self.sig.is_empty() {
            return Err(LinkFailure::MissingParams);
        }
        let ts = match &self.ts {
            Some(raw) => Some(raw.parse::<i64>().map_err(|_| LinkFailure::Expired)?),
            None => None,
        };
        verify(&self.machine_id, &self.sig, secret, ts, now, ttl_ms)
    }
}
