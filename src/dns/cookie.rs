//! EDNS0 COOKIE support (§4.7): the client cookie is `SipHash-2-4(key,
//! server-address)` truncated to 8 bytes. No `siphasher`-family crate
//! turned up anywhere in the corpus, so this is a small self-contained
//! port of the reference SipHash-2-4 algorithm (2 compression rounds, 4
//! finalization rounds), keyed with a 16-byte key the client seeds once
//! at `start` from the current time (§4.7 "seeds a 16-byte cookie key
//! from the current time").

pub const CLIENT_COOKIE_LEN: usize = 8;
pub const SERVER_COOKIE_MIN_LEN: usize = 16;
pub const SERVER_COOKIE_MAX_LEN: usize = 40;

struct SipHash24 {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

impl SipHash24 {
    fn new(key: &[u8; 16]) -> SipHash24 {
        let k0 = u64::from_le_bytes(key[0..8].try_into().unwrap());
        let k1 = u64::from_le_bytes(key[8..16].try_into().unwrap());
        SipHash24 {
            v0: k0 ^ 0x736f6d6570736575,
            v1: k1 ^ 0x646f72616e646f6d,
            v2: k0 ^ 0x6c7967656e657261,
            v3: k1 ^ 0x7465646279746573,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    fn hash(mut self, data: &[u8]) -> u64 {
        let len = data.len();
        let chunks = data.chunks_exact(8);
        let rem = chunks.remainder();
        for chunk in chunks {
            let m = u64::from_le_bytes(chunk.try_into().unwrap());
            self.v3 ^= m;
            self.round();
            self.round();
            self.v0 ^= m;
        }

        let mut last = [0u8; 8];
        last[..rem.len()].copy_from_slice(rem);
        last[7] = (len & 0xFF) as u8;
        let m = u64::from_le_bytes(last);
        self.v3 ^= m;
        self.round();
        self.round();
        self.v0 ^= m;

        self.v2 ^= 0xFF;
        self.round();
        self.round();
        self.round();
        self.round();

        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}

/// Compute the 8-byte client cookie for `data` (the server address bytes,
/// per §4.7) under `key`.
pub fn client_cookie(key: &[u8; 16], data: &[u8]) -> [u8; 8] {
    let h = SipHash24::new(key).hash(data);
    h.to_le_bytes()
}

/// `check_client_cookie` (§4.7): `1` if the request carried a client
/// cookie and the response echoes it, `-1` if the request had one but the
/// response's cookie option is absent or too short, `0` on mismatch, `2`
/// if the request had no cookie at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieCheck {
    Echoed,
    Missing,
    Mismatch,
    NotRequested,
}

pub fn check_client_cookie(req_cookie: Option<&[u8]>, resp_cookie: Option<&[u8]>) -> CookieCheck {
    let req = match req_cookie {
        Some(c) if c.len() >= CLIENT_COOKIE_LEN => &c[..CLIENT_COOKIE_LEN],
        _ => return CookieCheck::NotRequested,
    };
    match resp_cookie {
        Some(c) if c.len() >= CLIENT_COOKIE_LEN && &c[..CLIENT_COOKIE_LEN] == req => {
            CookieCheck::Echoed
        }
        Some(_) => CookieCheck::Mismatch,
        None => CookieCheck::Missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_cookie_is_deterministic() {
        let key = [7u8; 16];
        let addr = [192, 0, 2, 1];
        assert_eq!(client_cookie(&key, &addr), client_cookie(&key, &addr));
    }

    #[test]
    fn different_keys_produce_different_cookies() {
        let a = client_cookie(&[1u8; 16], b"93.184.216.34");
        let b = client_cookie(&[2u8; 16], b"93.184.216.34");
        assert_ne!(a, b);
    }

    #[test]
    fn check_client_cookie_cases() {
        let req = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut resp = req.to_vec();
        resp.extend_from_slice(&[0u8; 16]);
        assert_eq!(
            check_client_cookie(Some(&req), Some(&resp)),
            CookieCheck::Echoed
        );
        assert_eq!(
            check_client_cookie(Some(&req), None),
            CookieCheck::Missing
        );
        let mut wrong = resp.clone();
        wrong[0] ^= 0xFF;
        assert_eq!(
            check_client_cookie(Some(&req), Some(&wrong)),
            CookieCheck::Mismatch
        );
        assert_eq!(check_client_cookie(None, Some(&resp)), CookieCheck::NotRequested);
    }
}
