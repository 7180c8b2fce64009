use cardroom_protocol::Deck;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const DECK_DOMAIN: &[u8] = b"CARDROOM_DECK_V1";

/// Per-game seed. Each hand shuffles with `derive(hand_number)` so hands are
/// independent of each other and any hand can be reproduced from the seed alone.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameSeed {
    pub bytes: [u8; 32],
}

impl GameSeed {
    pub fn from_u64(x: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&x.to_le_bytes());
        GameSeed { bytes }
    }

    /// new = H(domain || seed || hand_number)
    pub fn derive(&self, hand_number: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DECK_DOMAIN);
        hasher.update(self.bytes);
        hasher.update(hand_number.to_le_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        GameSeed { bytes }
    }

    pub fn deck_for_hand(&self, hand_number: u64) -> Deck {
        let mut rng = StdRng::from_seed(self.derive(hand_number).bytes);
        Deck::shuffled_with(&mut rng)
    }
}
