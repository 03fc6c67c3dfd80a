//! Pre-accept authentication: verifies the `/stream` query-string
//! credentials before the WebSocket upgrade completes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::TinycamError;
use crate::utils::{b64_decode, b64_url_decode, now_unix_secs};

type HmacSha256 = Hmac<Sha256>;

/// Query parameters after parsing and validation, ready to seed a session.
pub struct AcceptedHandshake {
    pub exp: u64,
    pub cnonce: [u8; 16],
}

/// Checks `token`, `exp`, and `cnonce` against the access key and current
/// time. Any failure is reported as `AuthFailure`, mapped to HTTP 401 by
/// the caller - the peer never learns which check failed.
pub fn verify(access_key: &[u8; 32], query: &super::protocol::StreamQuery) -> Result<AcceptedHandshake, TinycamError> {
    let exp: u64 = query
        .exp
        .parse()
        .map_err(|_| TinycamError::AuthFailure("malformed exp".into()))?;

    if exp < now_unix_secs() {
        return Err(TinycamError::AuthFailure("expired token".into()));
    }

    let cnonce_bytes = b64_decode(&query.cnonce)
        .map_err(|_| TinycamError::AuthFailure("malformed cnonce encoding".into()))?;
    let cnonce: [u8; 16] = cnonce_bytes
        .try_into()
        .map_err(|_| TinycamError::AuthFailure("cnonce must decode to 16 bytes".into()))?;

    let token_bytes = b64_url_decode(&query.token)
        .map_err(|_| TinycamError::AuthFailure("malformed token encoding".into()))?;

    let mut mac = HmacSha256::new_from_slice(access_key)
        .expect("HMAC-SHA256 accepts any key length, 32 bytes always valid");
    mac.update(format!("stream:{exp}").as_bytes());
    let expected = mac.finalize().into_bytes();

    let matches = expected.len() == token_bytes.len()
        && bool::from(expected.as_slice().ct_eq(&token_bytes));
    if !matches {
        return Err(TinycamError::AuthFailure("token mismatch".into()));
    }

    Ok(AcceptedHandshake { exp, cnonce })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::protocol::StreamQuery;

    fn token_for(access_key: &[u8; 32], exp: u64) -> String {
        let mut mac = HmacSha256::new_from_slice(access_key).unwrap();
        mac.update(format!("stream:{exp}").as_bytes());
        crate::utils::b64_url_encode(&mac.finalize().into_bytes())
    }

    #[test]
    fn valid_token_and_future_exp_is_accepted() {
        let access_key = [5u8; 32];
        let exp = now_unix_secs() + 60;
        let query = StreamQuery {
            token: token_for(&access_key, exp),
            exp: exp.to_string(),
            cnonce: crate::utils::b64_encode(&[1u8; 16]),
        };
        let accepted = verify(&access_key, &query).unwrap();
        assert_eq!(accepted.exp, exp);
        assert_eq!(accepted.cnonce, [1u8; 16]);
    }

    #[test]
    fn expired_exp_is_rejected() {
        let access_key = [5u8; 32];
        let exp = now_unix_secs().saturating_sub(1);
        let query = StreamQuery {
            token: token_for(&access_key, exp),
            exp: exp.to_string(),
            cnonce: crate::utils::b64_encode(&[1u8; 16]),
        };
        assert!(verify(&access_key, &query).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let access_key = [5u8; 32];
        let wrong_key = [9u8; 32];
        let exp = now_unix_secs() + 60;
        let query = StreamQuery {
            token: token_for(&wrong_key, exp),
            exp: exp.to_string(),
            cnonce: crate::utils::b64_encode(&[1u8; 16]),
        };
        assert!(verify(&access_key, &query).is_err());
    }

    #[test]
    fn short_cnonce_is_rejected() {
        let access_key = [5u8; 32];
        let exp = now_unix_secs() + 60;
        let query = StreamQuery {
            token: token_for(&access_key, exp),
            exp: exp.to_string(),
            cnonce: crate::utils::b64_encode(&[1u8; 15]),
        };
        assert!(verify(&access_key, &query).is_err());
    }
}
