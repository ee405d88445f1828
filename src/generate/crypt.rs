//! SHA-512 crypt(3) (`$6$`) password hashing for the autoinstall identity.

use sha2::{Digest, Sha256, Sha512};

const ALPHABET: &[u8; 64] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const DEFAULT_ROUNDS: u32 = 5000;
const SALT_MAX: usize = 16;

/// Salt derived from stable inputs so repeated builds hash identically.
pub fn derived_salt(username: &str, hostname: &str) -> String {
    let digest = Sha256::digest(format!("{}@{}", username, hostname).as_bytes());
    digest
        .iter()
        .take(SALT_MAX)
        .map(|b| ALPHABET[(*b & 0x3f) as usize] as char)
        .collect()
}

/// Hash `password` unless it already is a crypt string.
pub fn password_hash(password: &str, salt: &str) -> String {
    if password.starts_with('$') {
        return password.to_string();
    }
    sha512_crypt(password.as_bytes(), salt.as_bytes())
}

pub fn sha512_crypt(password: &[u8], salt: &[u8]) -> String {
    let salt = &salt[..salt.len().min(SALT_MAX)];
    let key_len = password.len();

    let mut alt = Sha512::new();
    alt.update(password);
    alt.update(salt);
    alt.update(password);
    let alt_result = alt.finalize();

    let mut ctx = Sha512::new();
    ctx.update(password);
    ctx.update(salt);
    let mut cnt = key_len;
    while cnt > 64 {
        ctx.update(&alt_result[..]);
        cnt -= 64;
    }
    ctx.update(&alt_result[..cnt]);
    let mut cnt = key_len;
    while cnt > 0 {
        if cnt & 1 != 0 {
            ctx.update(&alt_result[..]);
        } else {
            ctx.update(password);
        }
        cnt >>= 1;
    }
    let mut result = ctx.finalize();

    let mut dp = Sha512::new();
    for _ in 0..key_len {
        dp.update(password);
    }
    let p_bytes = repeat_to(&dp.finalize(), key_len);

    let mut ds = Sha512::new();
    for _ in 0..(16 + result[0] as usize) {
        ds.update(salt);
    }
    let s_bytes = repeat_to(&ds.finalize(), salt.len());

    for round in 0..DEFAULT_ROUNDS {
        let mut c = Sha512::new();
        if round & 1 != 0 {
            c.update(&p_bytes);
        } else {
            c.update(&result[..]);
        }
        if round % 3 != 0 {
            c.update(&s_bytes);
        }
        if round % 7 != 0 {
            c.update(&p_bytes);
        }
        if round & 1 != 0 {
            c.update(&result[..]);
        } else {
            c.update(&p_bytes);
        }
        result = c.finalize();
    }

    let mut out = String::with_capacity(3 + salt.len() + 1 + 86);
    out.push_str("$6$");
    out.push_str(&String::from_utf8_lossy(salt));
    out.push('$');
    const ORDER: [(usize, usize, usize); 21] = [
        (0, 21, 42),
        (22, 43, 1),
        (44, 2, 23),
        (3, 24, 45),
        (25, 46, 4),
        (47, 5, 26),
        (6, 27, 48),
        (28, 49, 7),
        (50, 8, 29),
        (9, 30, 51),
        (31, 52, 10),
        (53, 11, 32),
        (12, 33, 54),
        (34, 55, 13),
        (56, 14, 35),
        (15, 36, 57),
        (37, 58, 16),
        (59, 17, 38),
        (18, 39, 60),
        (40, 61, 19),
        (62, 20, 41),
    ];
    for (a, b, c) in ORDER {
        push_b64(&mut out, result[a], result[b], result[c], 4);
    }
    push_b64(&mut out, 0, 0, result[63], 2);
    out
}

fn repeat_to(block: &[u8], len: usize) -> Vec<u8> {
    block.iter().copied().cycle().take(len).collect()
}

fn push_b64(out: &mut String, b2: u8, b1: u8, b0: u8, n: usize) {
    let mut w = (u32::from(b2) << 16) | (u32::from(b1) << 8) | u32::from(b0);
    for _ in 0..n {
        out.push(ALPHABET[(w & 0x3f) as usize] as char);
        w >>= 6;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_vector() {
        assert_eq!(
            sha512_crypt(b"Hello world!", b"saltstring"),
            "$6$saltstring$svn8UoSVapNtMuq1ukKS4tPQd8iKwSMHWjl/O817G3uBnIFNjnQJuesI68u4OTLiBFdcbYEdFCoEOfaS35inz1"
        );
    }

    #[test]
    fn salts_longer_than_sixteen_bytes_are_truncated() {
        // Published vector for rounds=5000, which is the default count.
        let hashed = sha512_crypt(b"This is just a test", b"toolongsaltstring");
        assert_eq!(
            hashed,
            "$6$toolongsaltstrin$lQ8jolhgVRVhY4b5pZKaysCLi0QBxGoNeKQzQ3glMhwllF7oGDZxUhx1yxdYcz/e1JSbq3y6JMxxl8audkUEm0"
        );
    }

    #[test]
    fn hashes_through_password_hash_match_the_reference() {
        assert_eq!(
            password_hash("Hello world!", "saltstring"),
            sha512_crypt(b"Hello world!", b"saltstring")
        );
    }

    #[test]
    fn derived_salt_is_stable_and_in_alphabet() {
        let a = derived_salt("ada", "ubuntu-fai");
        assert_eq!(a, derived_salt("ada", "ubuntu-fai"));
        assert_ne!(a, derived_salt("bob", "ubuntu-fai"));
        assert_eq!(a.len(), 16);
        assert!(a.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn prehashed_passwords_pass_through() {
        let hashed = "$6$abc$def";
        assert_eq!(password_hash(hashed, "ignored"), hashed);
    }
}
