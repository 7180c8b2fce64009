//! Hold'em hand strength, side pots and chip splitting.

use cardroom_protocol::{Card, Rank};
use std::collections::BTreeMap;

/// Ordered weakest to strongest; derived `Ord` compares the category first and
/// then the kickers in the order they are stored.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandRank {
    HighCard([Rank; 5]),
    OnePair(Rank, [Rank; 3]),
    TwoPair(Rank, Rank, Rank),
    ThreeOfAKind(Rank, [Rank; 2]),
    Straight(Rank),
    Flush([Rank; 5]),
    FullHouse(Rank, Rank),
    FourOfAKind(Rank, Rank),
    StraightFlush(Rank),
}

impl HandRank {
    pub fn name(&self) -> &'static str {
        match self {
            HandRank::HighCard(_) => "high card",
            HandRank::OnePair(..) => "one pair",
            HandRank::TwoPair(..) => "two pair",
            HandRank::ThreeOfAKind(..) => "three of a kind",
            HandRank::Straight(_) => "straight",
            HandRank::Flush(_) => "flush",
            HandRank::FullHouse(..) => "full house",
            HandRank::FourOfAKind(..) => "four of a kind",
            HandRank::StraightFlush(Rank::Ace) => "royal flush",
            HandRank::StraightFlush(_) => "straight flush",
        }
    }
}

fn straight_high(desc_unique: &[Rank]) -> Option<Rank> {
    if desc_unique.len() != 5 {
        return None;
    }
    if desc_unique[0].value() - desc_unique[4].value() == 4 {
        return Some(desc_unique[0]);
    }
    // wheel
    if desc_unique == [Rank::Ace, Rank::Five, Rank::Four, Rank::Three, Rank::Two] {
        return Some(Rank::Five);
    }
    None
}

pub fn evaluate5(cards: &[Card; 5]) -> HandRank {
    let mut ranks: Vec<Rank> = cards.iter().map(|c| c.rank).collect();
    ranks.sort_unstable_by(|a, b| b.cmp(a));
    let flush = cards.iter().all(|c| c.suit == cards[0].suit);

    let mut counts: BTreeMap<Rank, usize> = BTreeMap::new();
    for r in &ranks {
        *counts.entry(*r).or_default() += 1;
    }
    // (count, rank) with the biggest groups first, ties broken by rank
    let mut groups: Vec<(usize, Rank)> = counts.iter().map(|(r, n)| (*n, *r)).collect();
    groups.sort_unstable_by(|a, b| b.cmp(a));

    let unique: Vec<Rank> = groups.iter().map(|(_, r)| *r).collect();
    let straight = if groups.len() == 5 { straight_high(&unique) } else { None };

    if let (Some(high), true) = (straight, flush) {
        return HandRank::StraightFlush(high);
    }
    match groups.as_slice() {
        [(4, quad), (1, kicker)] => return HandRank::FourOfAKind(*quad, *kicker),
        [(3, trips), (2, pair)] => return HandRank::FullHouse(*trips, *pair),
        _ => {}
    }
    if flush {
        return HandRank::Flush([ranks[0], ranks[1], ranks[2], ranks[3], ranks[4]]);
    }
    if let Some(high) = straight {
        return HandRank::Straight(high);
    }
    match groups.as_slice() {
        [(3, trips), (1, a), (1, b)] => HandRank::ThreeOfAKind(*trips, [*a, *b]),
        [(2, high), (2, low), (1, kicker)] => HandRank::TwoPair(*high, *low, *kicker),
        [(2, pair), (1, a), (1, b), (1, c)] => HandRank::OnePair(*pair, [*a, *b, *c]),
        _ => HandRank::HighCard([ranks[0], ranks[1], ranks[2], ranks[3], ranks[4]]),
    }
}

/// Best five-card hand out of five to seven cards.
pub fn best_hand(cards: &[Card]) -> Option<HandRank> {
    let n = cards.len();
    if n < 5 {
        return None;
    }
    let mut best: Option<HandRank> = None;
    for a in 0..n {
        for b in a + 1..n {
            for c in b + 1..n {
                for d in c + 1..n {
                    for e in d + 1..n {
                        let rank = evaluate5(&[cards[a], cards[b], cards[c], cards[d], cards[e]]);
                        if best.as_ref().map_or(true, |b| rank > *b) {
                            best = Some(rank);
                        }
                    }
                }
            }
        }
    }
    best
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidePot {
    pub amount: u64,
    pub eligible: Vec<usize>,
}

/// Builds pots from total hand contributions `(seat, chips, still_in_hand)`.
/// Folded chips count toward every level they reach but folded seats are never
/// eligible. A level nobody live reached (an uncalled excess) folds into the
/// previous pot, or the next one when it is the first.
pub fn side_pots(contributions: &[(usize, u64, bool)]) -> Vec<SidePot> {
    let mut levels: Vec<u64> = contributions.iter().map(|c| c.1).filter(|&c| c > 0).collect();
    levels.sort_unstable();
    levels.dedup();

    let mut pots: Vec<SidePot> = Vec::new();
    let mut carry = 0u64;
    let mut prev = 0u64;
    for level in levels {
        let amount: u64 = contributions
            .iter()
            .map(|&(_, c, _)| c.min(level).saturating_sub(prev))
            .sum::<u64>()
            + carry;
        let eligible: Vec<usize> = contributions
            .iter()
            .filter(|&&(_, c, live)| live && c >= level)
            .map(|&(seat, _, _)| seat)
            .collect();
        prev = level;

        if eligible.is_empty() {
            match pots.last_mut() {
                Some(last) => last.amount += amount,
                None => carry = amount,
            }
            continue;
        }
        carry = 0;
        match pots.last_mut() {
            Some(last) if last.eligible == eligible => last.amount += amount,
            _ => pots.push(SidePot { amount, eligible }),
        }
    }
    pots
}

/// Splits `amount` evenly across `winners`, which must already be in payout
/// order (first seat left of the dealer first). Odd chips go to the front.
pub fn split(amount: u64, winners: &[usize]) -> Vec<(usize, u64)> {
    if winners.is_empty() {
        return Vec::new();
    }
    let n = winners.len() as u64;
    let share = amount / n;
    let remainder = (amount % n) as usize;
    winners
        .iter()
        .enumerate()
        .map(|(i, &seat)| (seat, share + u64::from(i < remainder)))
        .collect()
}
