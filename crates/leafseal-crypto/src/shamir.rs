//! Shamir secret sharing over GF(2^8)
//!
//! Share format (binary):
//! ```text
//! [1 byte: x][1 byte: threshold][N bytes: y_0..y_{N-1}][4 bytes: checksum]
//! checksum = BLAKE3(x || threshold || y)[..4]
//! ```
//!
//! Each byte of the secret is the intercept of its own random polynomial of
//! degree `threshold - 1`; share `i` holds every polynomial evaluated at
//! `x = i + 1`. The field is GF(2)[X] / (X^8 + X^4 + X^3 + X + 1).

use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

const HEADER_SIZE: usize = 2;
const CHECKSUM_SIZE: usize = 4;

/// Byte overhead a share adds on top of the secret
pub const SHARE_OVERHEAD: usize = HEADER_SIZE + CHECKSUM_SIZE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShamirError {
    #[error("threshold must be at least 1")]
    ThresholdTooSmall,

    #[error("threshold ({threshold}) cannot exceed total shares ({total})")]
    ThresholdExceedsTotal { threshold: usize, total: usize },

    #[error("total shares must be between 1 and 255, got {0}")]
    InvalidShareCount(usize),

    #[error("cannot split an empty secret")]
    EmptySecret,

    #[error("not enough shares: need {need}, have {have}")]
    NotEnoughShares { need: usize, have: usize },

    #[error("share {0} is corrupted (checksum mismatch or truncated)")]
    CorruptShare(usize),

    #[error("shares disagree on length or threshold")]
    InconsistentShares,

    #[error("duplicate share detected (x = {0})")]
    DuplicateShare(u8),
}

/// Split `secret` into `parts` shares, any `threshold` of which recover it.
///
/// With `parts == 1` the single "share" is the secret itself, untagged;
/// callers must only [`combine`] shares produced with `parts > 1`.
pub fn split(
    secret: &[u8],
    parts: usize,
    threshold: usize,
) -> Result<Vec<Zeroizing<Vec<u8>>>, ShamirError> {
    if secret.is_empty() {
        return Err(ShamirError::EmptySecret);
    }
    if parts == 0 || parts > 255 {
        return Err(ShamirError::InvalidShareCount(parts));
    }
    if threshold == 0 {
        return Err(ShamirError::ThresholdTooSmall);
    }
    if threshold > parts {
        return Err(ShamirError::ThresholdExceedsTotal {
            threshold,
            total: parts,
        });
    }
    if parts == 1 {
        return Ok(vec![Zeroizing::new(secret.to_vec())]);
    }

    let mut shares: Vec<Zeroizing<Vec<u8>>> = (0..parts)
        .map(|i| {
            let mut share = Vec::with_capacity(secret.len() + SHARE_OVERHEAD);
            share.push(i as u8 + 1);
            share.push(threshold as u8);
            share.resize(HEADER_SIZE + secret.len(), 0);
            Zeroizing::new(share)
        })
        .collect();

    let mut coefficients = vec![0u8; threshold];
    for (idx, &byte) in secret.iter().enumerate() {
        coefficients[0] = byte;
        rand::thread_rng().fill_bytes(&mut coefficients[1..]);
        for share in shares.iter_mut() {
            let x = share[0];
            share[HEADER_SIZE + idx] = evaluate(&coefficients, x);
        }
    }
    coefficients.zeroize();

    for share in shares.iter_mut() {
        let sum = checksum(&share[..]);
        share.extend_from_slice(&sum);
    }

    Ok(shares)
}

/// Reconstruct a secret from shares produced by [`split`].
///
/// Every share is checksummed; duplicates, mixed splits and too few shares
/// are rejected rather than yielding a wrong secret.
pub fn combine<S: AsRef<[u8]>>(shares: &[S]) -> Result<Zeroizing<Vec<u8>>, ShamirError> {
    let first = shares.first().ok_or(ShamirError::NotEnoughShares { need: 1, have: 0 })?;
    let share_len = first.as_ref().len();
    if share_len <= SHARE_OVERHEAD {
        return Err(ShamirError::CorruptShare(0));
    }
    let threshold = first.as_ref()[1] as usize;

    let mut xs = Vec::with_capacity(shares.len());
    for (i, share) in shares.iter().enumerate() {
        let share = share.as_ref();
        if share.len() != share_len || share[1] as usize != threshold {
            return Err(ShamirError::InconsistentShares);
        }
        let (body, sum) = share.split_at(share_len - CHECKSUM_SIZE);
        if checksum(body).as_slice() != sum || share[0] == 0 {
            return Err(ShamirError::CorruptShare(i));
        }
        if xs.contains(&share[0]) {
            return Err(ShamirError::DuplicateShare(share[0]));
        }
        xs.push(share[0]);
    }

    if threshold == 0 {
        return Err(ShamirError::CorruptShare(0));
    }
    if shares.len() < threshold {
        return Err(ShamirError::NotEnoughShares {
            need: threshold,
            have: shares.len(),
        });
    }

    let secret_len = share_len - SHARE_OVERHEAD;
    let mut secret = Zeroizing::new(vec![0u8; secret_len]);
    let mut ys = Zeroizing::new(vec![0u8; xs.len()]);
    for idx in 0..secret_len {
        for (i, share) in shares.iter().enumerate() {
            ys[i] = share.as_ref()[HEADER_SIZE + idx];
        }
        secret[idx] = interpolate_at_zero(&xs, &ys);
    }
    Ok(secret)
}

fn checksum(body: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let hash = blake3::hash(body);
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&hash.as_bytes()[..CHECKSUM_SIZE]);
    out
}

/// Horner evaluation of the polynomial at `x`.
fn evaluate(coefficients: &[u8], x: u8) -> u8 {
    coefficients
        .iter()
        .rev()
        .fold(0u8, |acc, &c| add(mul(acc, x), c))
}

/// Lagrange interpolation of the sample points, evaluated at x = 0.
fn interpolate_at_zero(xs: &[u8], ys: &[u8]) -> u8 {
    let mut result = 0u8;
    for (i, (&xi, &yi)) in xs.iter().zip(ys).enumerate() {
        let mut basis = 1u8;
        for (j, &xj) in xs.iter().enumerate() {
            if i == j {
                continue;
            }
            // (0 - xj) / (xi - xj); subtraction is XOR
            basis = mul(basis, div(xj, add(xi, xj)));
        }
        result = add(result, mul(yi, basis));
    }
    result
}

#[inline]
fn add(a: u8, b: u8) -> u8 {
    a ^ b
}

/// Branch-free multiplication in GF(2^8).
fn mul(a: u8, b: u8) -> u8 {
    let mut acc = 0u8;
    for i in (0..8).rev() {
        let bit = (b >> i) & 1;
        let a_or_zero = 0u8.wrapping_sub(bit) & a;
        let reduce = 0u8.wrapping_sub(acc >> 7) & 0x1B;
        acc = a_or_zero ^ reduce ^ (acc << 1);
    }
    acc
}

/// a^254 = a^-1 for non-zero a (0 maps to 0).
fn inverse(a: u8) -> u8 {
    let mut b = mul(a, a); // a^2
    let mut c = mul(a, b); // a^3
    b = mul(c, c); // a^6
    b = mul(b, b); // a^12
    c = mul(b, c); // a^15
    b = mul(b, b); // a^24
    b = mul(b, b); // a^48
    b = mul(b, c); // a^63
    b = mul(b, b); // a^126
    b = mul(a, b); // a^127
    mul(b, b)
}

/// Division in GF(2^8). `b` is never zero here because x coordinates are
/// distinct and non-zero.
fn div(a: u8, b: u8) -> u8 {
    mul(a, inverse(b))
}
