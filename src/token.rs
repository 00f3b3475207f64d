use crate::id::{ShaHash, SHA_HASH_LEN};
use std::{
    convert::TryInto,
    net::Ipv4Addr,
    time::{Duration, Instant},
};

// Tokens are not stored. A token is the SHA-1 of the requester's address and a secret, and an
// announce is accepted if its token matches under the current or the previous secret. With the
// secret rotating every interval, a token stays valid for between one and two intervals.

const SECRET_BUFFER_LEN: usize = 4 + 4;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct Token([u8; SHA_HASH_LEN]);

impl Token {
    /// Parse a token received from the wire. Anything but 20 bytes is not one of ours.
    pub fn new(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }
}

impl AsRef<[u8]> for Token {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ----------------------------------------------------------------------------//

pub(crate) struct TokenStore {
    curr_secret: u32,
    last_secret: u32,
    last_refresh: Instant,
    interval: Duration,
}

impl TokenStore {
    pub fn new(interval: Duration, now: Instant) -> TokenStore {
        // Both secrets are random so that a freshly started node does not accept tokens made
        // with a guessable placeholder.
        TokenStore {
            curr_secret: rand::random(),
            last_secret: rand::random(),
            last_refresh: now,
            interval,
        }
    }

    pub fn checkout(&mut self, addr: Ipv4Addr, now: Instant) -> Token {
        self.refresh_check(now);

        generate_token(addr, self.curr_secret)
    }

    pub fn checkin(&mut self, addr: Ipv4Addr, token: &[u8], now: Instant) -> bool {
        self.refresh_check(now);

        let token = match Token::new(token) {
            Some(token) => token,
            None => return false,
        };

        token == generate_token(addr, self.curr_secret)
            || token == generate_token(addr, self.last_secret)
    }

    /// Rotate the secret if an interval has passed. Also called lazily on every checkout and
    /// checkin.
    pub fn refresh_check(&mut self, now: Instant) {
        match intervals_passed(self.last_refresh, self.interval, now) {
            0 => (),
            1 => {
                self.last_secret = self.curr_secret;
                self.curr_secret = rand::random();
                self.last_refresh = now;
            }
            _ => {
                // Both secrets are too old.
                self.last_secret = rand::random();
                self.curr_secret = rand::random();
                self.last_refresh = now;
            }
        }
    }
}

fn intervals_passed(last_refresh: Instant, interval: Duration, now: Instant) -> u128 {
    let interval = interval.as_millis().max(1);
    now.saturating_duration_since(last_refresh).as_millis() / interval
}

fn generate_token(addr: Ipv4Addr, secret: u32) -> Token {
    let mut buffer = [0u8; SECRET_BUFFER_LEN];
    buffer[..4].copy_from_slice(&addr.octets());
    buffer[4..].copy_from_slice(&secret.to_be_bytes());

    Token(ShaHash::sha1(&buffer).into())
}
