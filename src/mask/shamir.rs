//! Shamir secret sharing over the prime field of order `2^521 - 1`.

use std::collections::HashSet;

use num::{bigint::BigUint, One, Zero};
use once_cell::sync::Lazy;
use rand::RngCore;

use crate::mask::{MaskError, SecretShare};

/// The exponent of the Mersenne prime which defines the field.
pub const MERSENNE_EXPONENT: usize = 521;

static PRIME: Lazy<BigUint> = Lazy::new(|| (BigUint::one() << MERSENNE_EXPONENT) - 1_u32);

/// Draws a uniform-enough field element. The bias of the reduction is below `2^-500`.
fn random_element(rng: &mut dyn RngCore) -> BigUint {
    let mut bytes = [0_u8; 128];
    rng.fill_bytes(&mut bytes);
    BigUint::from_bytes_be(&bytes) % &*PRIME
}

fn evaluate(coefficients: &[BigUint], x: u32) -> BigUint {
    let x = BigUint::from(x);
    coefficients
        .iter()
        .rev()
        .fold(BigUint::zero(), |acc, coefficient| (acc * &x + coefficient) % &*PRIME)
}

fn sub_mod(a: &BigUint, b: &BigUint) -> BigUint {
    (&*PRIME + a - b) % &*PRIME
}

fn inverse(a: &BigUint) -> BigUint {
    a.modpow(&(&*PRIME - 2_u32), &PRIME)
}

/// Splits `secret` into one share per index. Any `threshold` of the shares rebuild it.
pub fn split(
    secret: &[u8],
    threshold: usize,
    indices: &[u32],
    rng: &mut dyn RngCore,
) -> Result<Vec<SecretShare>, MaskError> {
    if threshold == 0 || threshold > indices.len() {
        return Err(MaskError::InvalidThreshold {
            threshold,
            shares: indices.len(),
        });
    }
    let mut seen = HashSet::new();
    if let Some(index) = indices.iter().find(|index| **index == 0 || !seen.insert(**index)) {
        return Err(MaskError::InvalidShareIndex(*index));
    }

    let mut coefficients = Vec::with_capacity(threshold);
    coefficients.push(BigUint::from_bytes_be(secret));
    coefficients.extend((1..threshold).map(|_| random_element(rng)));

    Ok(indices
        .iter()
        .map(|index| SecretShare {
            index: *index,
            value: evaluate(&coefficients, *index).to_bytes_be(),
        })
        .collect())
}

/// Rebuilds a secret of `len` bytes from the first `threshold` shares by Lagrange interpolation
/// at zero.
pub fn combine(shares: &[SecretShare], threshold: usize, len: usize) -> Result<Vec<u8>, MaskError> {
    if threshold == 0 {
        return Err(MaskError::InvalidThreshold {
            threshold,
            shares: shares.len(),
        });
    }
    if shares.len() < threshold {
        return Err(MaskError::NotEnoughShares {
            available: shares.len(),
            threshold,
        });
    }
    let shares = &shares[..threshold];
    let mut seen = HashSet::new();
    if let Some(share) = shares
        .iter()
        .find(|share| share.index == 0 || !seen.insert(share.index))
    {
        return Err(MaskError::InvalidShareIndex(share.index));
    }

    let xs = shares
        .iter()
        .map(|share| BigUint::from(share.index))
        .collect::<Vec<_>>();
    let mut secret = BigUint::zero();
    for (i, share) in shares.iter().enumerate() {
        let y = BigUint::from_bytes_be(&share.value);
        if y >= *PRIME {
            return Err(MaskError::InvalidShares);
        }
        let mut numerator = BigUint::one();
        let mut denominator = BigUint::one();
        for (j, x) in xs.iter().enumerate() {
            if i != j {
                numerator = numerator * x % &*PRIME;
                denominator = denominator * sub_mod(x, &xs[i]) % &*PRIME;
            }
        }
        secret = (secret + y * numerator % &*PRIME * inverse(&denominator)) % &*PRIME;
    }

    let bytes = secret.to_bytes_be();
    if bytes.len() > len {
        return Err(MaskError::InvalidShares);
    }
    let mut padded = vec![0_u8; len - bytes.len()];
    padded.extend_from_slice(&bytes);
    Ok(padded)
}
