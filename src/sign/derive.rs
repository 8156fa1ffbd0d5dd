//! BIP-32 non-hardened child-key derivation over secp256k1.
//!
//! Signing against a derived address only needs the public tweak: the child
//! public key plus the accumulated scalar delta the party library applies to
//! its share. Hardened indices require the private key and are rejected.

use hmac::{Hmac, Mac};
use k256::elliptic_curve::ff::{Field, PrimeField};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{ProjectivePoint, PublicKey, Scalar};
use sha2::Sha512;

use crate::party::DerivationTweak;
use crate::TssdResult;
use anyhow::anyhow;

type HmacSha512 = Hmac<Sha512>;

const HARDENED_OFFSET: u32 = 0x8000_0000;

/// Walks `path` from the master public key, returning the summed tweak and
/// the derived child key (compressed SEC1). An empty path yields a zero
/// delta and the master key itself.
pub fn derive_child_key(
    master_public_key: &[u8],
    chain_code: &[u8],
    path: &[u32],
) -> TssdResult<DerivationTweak> {
    let mut public = PublicKey::from_sec1_bytes(master_public_key)
        .map_err(|_| anyhow!("master public key is not a valid secp256k1 point"))?;
    let mut chain = chain_code.to_vec();
    let mut delta = Scalar::ZERO;

    for &index in path {
        if index >= HARDENED_OFFSET {
            return Err(anyhow!(
                "hardened index {index} cannot be derived from a public key"
            ));
        }

        let mut mac =
            HmacSha512::new_from_slice(&chain).map_err(|_| anyhow!("invalid chain code"))?;
        mac.update(public.to_encoded_point(true).as_bytes());
        mac.update(&index.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let il: [u8; 32] = digest[..32].try_into().expect("hmac output is 64 bytes");
        let tweak = Option::<Scalar>::from(Scalar::from_repr(il.into()))
            .filter(|scalar| !bool::from(scalar.is_zero()))
            .ok_or_else(|| anyhow!("unusable child index {index}"))?;

        let child = public.to_projective() + ProjectivePoint::GENERATOR * tweak;
        public = PublicKey::from_affine(child.to_affine())
            .map_err(|_| anyhow!("derived the identity point at index {index}"))?;
        chain = digest[32..].to_vec();
        delta += tweak;
    }

    Ok(DerivationTweak {
        delta: delta.to_bytes().into(),
        child_public_key: public.to_encoded_point(true).as_bytes().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master() -> (Scalar, Vec<u8>) {
        let secret = Scalar::from(424242u64);
        let point = (ProjectivePoint::GENERATOR * secret).to_affine();
        let public = PublicKey::from_affine(point).unwrap();
        (secret, public.to_encoded_point(true).as_bytes().to_vec())
    }

    #[test]
    fn empty_path_returns_master() {
        let (_, master_bytes) = master();
        let tweak = derive_child_key(&master_bytes, b"chain-code", &[]).unwrap();
        assert_eq!(tweak.child_public_key, master_bytes);
        assert_eq!(tweak.delta, [0u8; 32]);
    }

    #[test]
    fn child_key_equals_master_plus_delta() {
        let (_, master_bytes) = master();
        let tweak = derive_child_key(&master_bytes, b"chain-code", &[44, 118, 0]).unwrap();

        let delta = Option::<Scalar>::from(Scalar::from_repr(tweak.delta.into())).unwrap();
        let master_point = PublicKey::from_sec1_bytes(&master_bytes)
            .unwrap()
            .to_projective();
        let expected = (master_point + ProjectivePoint::GENERATOR * delta).to_affine();
        let expected = PublicKey::from_affine(expected).unwrap();

        assert_eq!(
            tweak.child_public_key,
            expected.to_encoded_point(true).as_bytes().to_vec()
        );
        assert_ne!(tweak.child_public_key, master_bytes);
    }

    #[test]
    fn derivation_is_deterministic_and_path_sensitive() {
        let (_, master_bytes) = master();
        let first = derive_child_key(&master_bytes, b"cc", &[1, 2]).unwrap();
        let again = derive_child_key(&master_bytes, b"cc", &[1, 2]).unwrap();
        let other_path = derive_child_key(&master_bytes, b"cc", &[2, 1]).unwrap();
        let other_chain = derive_child_key(&master_bytes, b"dd", &[1, 2]).unwrap();

        assert_eq!(first.child_public_key, again.child_public_key);
        assert_ne!(first.child_public_key, other_path.child_public_key);
        assert_ne!(first.child_public_key, other_chain.child_public_key);
    }

    #[test]
    fn hardened_indices_are_rejected() {
        let (_, master_bytes) = master();
        assert!(derive_child_key(&master_bytes, b"cc", &[HARDENED_OFFSET]).is_err());
        assert!(derive_child_key(&master_bytes, b"cc", &[0x8000_0001]).is_err());
    }

    #[test]
    fn garbage_master_key_is_rejected() {
        assert!(derive_child_key(&[0u8; 33], b"cc", &[1]).is_err());
    }
}
