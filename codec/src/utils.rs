// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::{fmt, str};

use crate::error::DecodeError;

/// Maximum length of a client identifier, per [MQTT-3.1.3-5].
pub const MAX_CLIENT_ID_LEN: usize = 23;

const CLIENT_ID_CHARS: &[u8] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug)]
pub struct StringError;

impl fmt::Display for StringError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bytes are not valid utf-8")
    }
}

impl std::error::Error for StringError {}

/// Convert `bytes` into a `String`, rejecting malformed utf-8.
///
/// # Errors
///
/// Returns error if `bytes` is not valid utf-8.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, DecodeError> {
    str::from_utf8(bytes)
        .map(ToOwned::to_owned)
        .map_err(|_err| DecodeError::InvalidString)
}

/// Validate a client-supplied client id against [MQTT-3.1.3-5].
///
/// An empty client id is accepted here; callers decide whether an empty id
/// is acceptable given the `CleanSession` flag, per [MQTT-3.1.3-7].
///
/// # Errors
///
/// Returns error if `client_id` is too long or contains characters outside
/// the allowed set.
pub fn validate_client_id(client_id: &str) -> Result<(), DecodeError> {
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(DecodeError::InvalidClientId);
    }
    if client_id
        .bytes()
        .all(|b| CLIENT_ID_CHARS.contains(&b))
    {
        Ok(())
    } else {
        Err(DecodeError::InvalidClientId)
    }
}

/// Generate a random client id made up of characters from the allowed set.
#[must_use]
pub fn random_client_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..MAX_CLIENT_ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..CLIENT_ID_CHARS.len());
            CLIENT_ID_CHARS[idx] as char
        })
        .collect()
}

/// Keep-alive is a 16-bit value; any value is syntactically legal, this
/// exists for symmetry with the other `validate_*` helpers and as a place
/// to hook future range restrictions.
///
/// # Errors
///
/// Never returns an error; reserved for protocol revisions that restrict
/// the range.
pub fn validate_keep_alive(_keep_alive: u16) -> Result<(), DecodeError> {
    Ok(())
}
