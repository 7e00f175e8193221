use std::collections::BTreeSet;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jose_jwk::{Jwk, Key, crypto};
use p256::SecretKey;
use rand::RngCore;
use rand::rngs::ThreadRng;
use sha2::{Digest, Sha256};
use smol_str::SmolStr;

use crate::dpop::DpopError;

/// PKCE code verifier: 32 cryptographically-random bytes, base64url without
/// padding (43 characters).
pub fn generate_code_verifier() -> SmolStr {
    URL_SAFE_NO_PAD.encode(get_random_values::<32>()).into()
}

/// PKCE S256 code challenge for a verifier (RFC 7636 §4.2).
pub fn code_challenge(verifier: &str) -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(Sha256::digest(verifier.as_bytes()))
        .into()
}

/// Random `state` parameter for an authorization request.
pub fn generate_state() -> SmolStr {
    URL_SAFE_NO_PAD.encode(get_random_values::<16>()).into()
}

fn get_random_values<const LEN: usize>() -> [u8; LEN] {
    let mut bytes = [0u8; LEN];
    ThreadRng::default().fill_bytes(&mut bytes);
    bytes
}

/// Generate a fresh ES256 (P-256) keypair for DPoP.
pub fn generate_dpop_key() -> Key {
    Key::from(&crypto::Key::from(SecretKey::random(
        &mut ThreadRng::default(),
    )))
}

fn secret_key(key: &Key) -> Result<SecretKey, DpopError> {
    match crypto::Key::try_from(key).map_err(DpopError::JwkCrypto)? {
        crypto::Key::P256(crypto::Kind::Secret(secret)) => Ok(secret),
        _ => Err(DpopError::UnsupportedKey),
    }
}

/// The private half as a JWK ready for persistence: ES256, signing class,
/// `sign` as the only key operation.
pub fn private_jwk(key: &Key) -> Jwk {
    let mut prm = jose_jwk::Parameters::default();
    prm.alg = Some(jose_jwa::Algorithm::Signing(jose_jwa::Signing::Es256));
    prm.cls = Some(jose_jwk::Class::Signing);
    prm.ops = Some(BTreeSet::from([jose_jwk::Operations::Sign]));
    Jwk {
        key: key.clone(),
        prm,
    }
}

/// The public half as a JWK, carrying no operation flags so that strict
/// validators accept it when embedded in proof headers.
pub fn public_jwk(key: &Key) -> Result<Jwk, DpopError> {
    let secret = secret_key(key)?;
    Ok(Jwk {
        key: Key::from(&crypto::Key::from(secret.public_key())),
        prm: Default::default(),
    })
}

/// Import a stored private JWK for signing. Whatever operation flags the
/// stored parameters carry are discarded; only the key material is used, so
/// a conflicting `key_ops` list cannot block the import.
pub fn signing_key_from_jwk(jwk: &Jwk) -> Result<p256::ecdsa::SigningKey, DpopError> {
    Ok(p256::ecdsa::SigningKey::from(secret_key(&jwk.key)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_shape() {
        let verifier = generate_code_verifier();
        assert_eq!(verifier.len(), 43);
        assert!(
            verifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn verifiers_are_unique() {
        assert_ne!(generate_code_verifier(), generate_code_verifier());
    }

    // RFC 7636 appendix B test vector.
    #[test]
    fn challenge_matches_rfc_vector() {
        assert_eq!(
            code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn challenge_shape() {
        let challenge = code_challenge(&generate_code_verifier());
        assert_eq!(challenge.len(), 43);
    }

    #[test]
    fn generated_key_round_trips_through_jwk() {
        let key = generate_dpop_key();
        let private = private_jwk(&key);
        assert!(signing_key_from_jwk(&private).is_ok());
        assert!(public_jwk(&key).is_ok());
    }

    #[test]
    fn public_jwk_has_no_operation_flags() {
        let key = generate_dpop_key();
        let public = public_jwk(&key).unwrap();
        assert!(public.prm.ops.is_none());
        assert!(matches!(
            crypto::Key::try_from(&public.key),
            Ok(crypto::Key::P256(crypto::Kind::Public(_)))
        ));
    }
}
