//! Signature envelope: `unwrap(J) -> {payload, mech_name, signer_userid}`.
//!
//! The core never re-verifies cryptographic signatures (spec §4.2); only
//! the "none" mech, legal solely for the owner role, is implemented here.
//! A real cryptographic mech is represented as an opaque, refused variant:
//! a deployment that has already verified a signature elsewhere constructs
//! an `Envelope` directly via `Envelope::already_verified` instead of
//! calling `unwrap`.

use serde::{Deserialize, Serialize};

use crate::error::{FluxError, FluxResult};

pub const OWNER_USERID: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub mech_name: String,
    pub signer_userid: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct NoneHeader {
    version: u32,
    userid: u32,
}

fn b64url_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = *chunk.get(1).unwrap_or(&0) as u32;
        let b2 = *chunk.get(2).unwrap_or(&0) as u32;
        let n = (b0 << 16) | (b1 << 8) | b2;
        out.push(ALPHABET[((n >> 18) & 0x3f) as usize] as char);
        out.push(ALPHABET[((n >> 12) & 0x3f) as usize] as char);
        if chunk.len() > 1 {
            out.push(ALPHABET[((n >> 6) & 0x3f) as usize] as char);
        }
        if chunk.len() > 2 {
            out.push(ALPHABET[(n & 0x3f) as usize] as char);
        }
    }
    out
}

fn b64url_decode(s: &str) -> FluxResult<Vec<u8>> {
    fn val(c: u8) -> Option<u32> {
        match c {
            b'A'..=b'Z' => Some((c - b'A') as u32),
            b'a'..=b'z' => Some((c - b'a') as u32 + 26),
            b'0'..=b'9' => Some((c - b'0') as u32 + 52),
            b'-' => Some(62),
            b'_' => Some(63),
            _ => None,
        }
    }
    let chars: Vec<u8> = s.bytes().collect();
    let mut out = Vec::with_capacity(chars.len() * 3 / 4 + 3);
    for chunk in chars.chunks(4) {
        let vals: Vec<u32> = chunk
            .iter()
            .map(|&c| val(c).ok_or_else(|| FluxError::invalid("bad base64url character")))
            .collect::<FluxResult<_>>()?;
        let n = vals
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, v)| acc | (v << (18 - 6 * i)));
        out.push((n >> 16) as u8);
        if vals.len() > 2 {
            out.push((n >> 8) as u8);
        }
        if vals.len() > 3 {
            out.push(n as u8);
        }
    }
    Ok(out)
}

/// Build a mech-"none" envelope (only legal for wrap performed by the
/// owner; enforcement of that rule lives at the call site, since `wrap`
/// itself has no notion of the submitter's credential).
pub fn wrap_none(payload: &[u8], userid: u32) -> String {
    let header = NoneHeader { version: 1, userid };
    let header_json = serde_json::to_vec(&header).expect("header always serializes");
    format!(
        "{}.{}",
        b64url_encode(&header_json),
        b64url_encode(payload)
    )
}

/// `unwrap(J) -> Envelope` for the "none" mech. Any other recognizable mech
/// marker is reported as `Unsupported`, per the must-not-re-verify contract.
pub fn unwrap(j: &str) -> FluxResult<Envelope> {
    let (header_part, payload_part) = j
        .split_once('.')
        .ok_or_else(|| FluxError::invalid("malformed envelope: missing separator"))?;
    let header_bytes = b64url_decode(header_part)?;
    let header: NoneHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| FluxError::invalid(format!("malformed envelope header: {e}")))?;
    if header.version != 1 {
        return Err(FluxError::Unsupported(format!(
            "unsupported envelope version {}",
            header.version
        )));
    }
    let payload = b64url_decode(payload_part)?;
    Ok(Envelope {
        payload,
        mech_name: "none".to_string(),
        signer_userid: header.userid,
    })
}

/// Construct an envelope for a payload that has already been verified by
/// an external security collaborator (the deferred "full" mech).
pub fn already_verified(payload: Vec<u8>, signer_userid: u32) -> Envelope {
    Envelope {
        payload,
        mech_name: "verified".to_string(),
        signer_userid,
    }
}

/// Validate that `none` mech is permitted (owner role) and that the
/// signer userid matches the authenticated request userid.
pub fn check_envelope(env: &Envelope, is_owner: bool, authenticated_userid: u32) -> FluxResult<()> {
    if env.mech_name == "none" && !is_owner {
        return Err(FluxError::denied(
            "sign-type=none is only permitted for the owner role",
        ));
    }
    if env.signer_userid != authenticated_userid {
        return Err(FluxError::denied(format!(
            "envelope signer userid {} does not match authenticated userid {}",
            env.signer_userid, authenticated_userid
        )));
    }
    Ok(())
}
