//! No-limit hold'em state machine.
//!
//! Everything here is a pure function of the current [`GameState`] and the
//! submitted action: the deck comes from the game seed, there is no clock and
//! no I/O, so replaying the same actions from the same state always lands on
//! the same result. That is what snapshot + log recovery relies on.

use crate::error::EngineError;
use crate::eval::{best_hand, side_pots, split, HandRank};
use crate::seed::GameSeed;
use cardroom_protocol::{
    ActionKind, ActionRecord, Card, HandResult, LegalAction, Payout, Phase, PlayerStatus, PrivateState,
    PublicPlayer, PublicState, Rank,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ==== knobs ====
pub const MAX_SEATS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeatAssignment {
    pub seat: usize,
    pub user_id: String,
    pub stack: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Blinds {
    pub small: u64,
    pub big: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerState {
    pub seat: usize,
    pub user_id: String,
    pub stack: u64,
    pub hole: Vec<Card>,
    pub round_contribution: u64,
    pub hand_contribution: u64,
    pub status: PlayerStatus,
    pub acted: bool,
}

impl PlayerState {
    fn in_hand(&self) -> bool {
        matches!(self.status, PlayerStatus::Active | PlayerStatus::AllIn)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameState {
    pub game_id: String,
    pub seed: GameSeed,
    pub small_blind: u64,
    pub big_blind: u64,
    pub hand_number: u64,
    pub phase: Phase,
    pub pot: u64,
    /// Sorted by seat number.
    pub players: Vec<PlayerState>,
    pub board: Vec<Card>,
    pub deck: Vec<Card>,
    pub dealer_seat: usize,
    pub small_blind_seat: usize,
    pub big_blind_seat: usize,
    pub to_act: Option<usize>,
    pub current_bet: u64,
    pub min_raise: u64,
    pub version: u64,
    pub last_action: Option<ActionRecord>,
    pub last_result: Option<HandResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub version: u64,
    pub record: ActionRecord,
    /// Hands this action brought to an end, oldest first.
    pub completed_hands: Vec<HandResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Engine {
    state: GameState,
}

impl Engine {
    /// Seats the table and deals the first hand. Version starts at 0.
    pub fn start_hand(
        game_id: &str,
        seed: GameSeed,
        blinds: Blinds,
        seats: &[SeatAssignment],
    ) -> Result<Self, EngineError> {
        if blinds.big == 0 || blinds.small > blinds.big {
            return Err(EngineError::InvalidAmount {
                amount: blinds.small,
                min: 1,
                max: blinds.big,
            });
        }
        if seats.len() > MAX_SEATS {
            return Err(EngineError::TooManySeats(seats.len()));
        }
        if seats.iter().filter(|s| s.stack > 0).count() < 2 {
            return Err(EngineError::NotEnoughPlayers);
        }

        let mut players: Vec<PlayerState> = seats
            .iter()
            .map(|s| PlayerState {
                seat: s.seat,
                user_id: s.user_id.clone(),
                stack: s.stack,
                hole: vec![],
                round_contribution: 0,
                hand_contribution: 0,
                status: PlayerStatus::SittingOut,
                acted: false,
            })
            .collect();
        players.sort_by_key(|p| p.seat);

        let mut state = GameState {
            game_id: game_id.to_string(),
            seed,
            small_blind: blinds.small,
            big_blind: blinds.big,
            hand_number: 0,
            phase: Phase::Preflop,
            pot: 0,
            players,
            board: vec![],
            deck: vec![],
            dealer_seat: 0,
            small_blind_seat: 0,
            big_blind_seat: 0,
            to_act: None,
            current_bet: 0,
            min_raise: blinds.big,
            version: 0,
            last_action: None,
            last_result: None,
        };
        deal_new_hand(&mut state);
        let bb = state.big_blind_seat;
        play_on(&mut state, bb);
        Ok(Engine { state })
    }

    pub fn from_state(state: GameState) -> Self {
        Engine { state }
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    pub fn into_state(self) -> GameState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.state.version
    }

    pub fn seat_of(&self, user_id: &str) -> Option<usize> {
        self.state.players.iter().find(|p| p.user_id == user_id).map(|p| p.seat)
    }

    /// Sum of everyone's chips committed to the current hand. Always equals the pot.
    pub fn contributions_total(&self) -> u64 {
        self.state.players.iter().map(|p| p.hand_contribution).sum()
    }

    /// Validates and applies one action. On `Err` the state is untouched.
    pub fn player_action(
        &mut self,
        seat: usize,
        action: ActionKind,
        amount: u64,
    ) -> Result<ActionOutcome, EngineError> {
        let g = &mut self.state;
        let (pay, target) = validate_action(g, seat, action, amount)?;

        if let Some(p) = g.players.iter_mut().find(|p| p.seat == seat) {
            p.acted = true;
            if action == ActionKind::Fold {
                p.status = PlayerStatus::Folded;
            }
        }
        let paid = commit(g, seat, pay);

        if target > g.current_bet {
            let raise_by = target - g.current_bet;
            // a short all-in raise moves the bet but not the minimum increment
            if raise_by >= g.min_raise {
                g.min_raise = raise_by;
            }
            g.current_bet = target;
            for q in g.players.iter_mut() {
                if q.seat != seat && q.status == PlayerStatus::Active {
                    q.acted = false;
                }
            }
        }

        let record = ActionRecord { seat, action, amount: paid };
        g.last_action = Some(record.clone());
        g.version += 1;
        let completed_hands = play_on(g, seat);

        Ok(ActionOutcome {
            version: g.version,
            record,
            completed_hands,
        })
    }

    pub fn legal_actions(&self, seat: usize) -> Vec<LegalAction> {
        let g = &self.state;
        if !g.phase.is_betting() || g.to_act != Some(seat) {
            return vec![];
        }
        let Some(p) = g.players.iter().find(|p| p.seat == seat) else {
            return vec![];
        };
        let to_call = g.current_bet.saturating_sub(p.round_contribution);
        let max_to = p.round_contribution + p.stack;
        let mut out = Vec::new();

        if to_call > 0 {
            out.push(LegalAction { action: ActionKind::Fold, min: 0, max: 0 });
            let call = to_call.min(p.stack);
            out.push(LegalAction { action: ActionKind::Call, min: call, max: call });
        } else {
            out.push(LegalAction { action: ActionKind::Check, min: 0, max: 0 });
        }
        if g.current_bet == 0 {
            out.push(LegalAction {
                action: ActionKind::Bet,
                min: g.big_blind.min(max_to),
                max: max_to,
            });
        } else if p.stack > to_call {
            out.push(LegalAction {
                action: ActionKind::Raise,
                min: (g.current_bet + g.min_raise).min(max_to),
                max: max_to,
            });
        }
        out.push(LegalAction { action: ActionKind::AllIn, min: max_to, max: max_to });
        out
    }

    /// Table as everyone may see it. Hole cards are left out.
    pub fn public_view(&self) -> PublicState {
        let g = &self.state;
        PublicState {
            game_id: g.game_id.clone(),
            hand_number: g.hand_number,
            phase: g.phase,
            pot: g.pot,
            board: g.board.clone(),
            dealer_seat: g.dealer_seat,
            small_blind_seat: g.small_blind_seat,
            big_blind_seat: g.big_blind_seat,
            to_act: g.to_act,
            current_bet: g.current_bet,
            min_raise: g.min_raise,
            small_blind: g.small_blind,
            big_blind: g.big_blind,
            players: g
                .players
                .iter()
                .map(|p| PublicPlayer {
                    seat: p.seat,
                    user_id: p.user_id.clone(),
                    stack: p.stack,
                    round_contribution: p.round_contribution,
                    hand_contribution: p.hand_contribution,
                    status: p.status,
                    has_cards: p.in_hand() && !p.hole.is_empty(),
                })
                .collect(),
            last_action: g.last_action.clone(),
            last_result: g.last_result.clone(),
            version: g.version,
        }
    }

    pub fn private_view(&self, seat: usize) -> Option<PrivateState> {
        let g = &self.state;
        let p = g.players.iter().find(|p| p.seat == seat)?;
        let to_call = if p.status == PlayerStatus::Active {
            g.current_bet.saturating_sub(p.round_contribution).min(p.stack)
        } else {
            0
        };
        Some(PrivateState {
            seat: Some(seat),
            my_cards: p.hole.clone(),
            legal_actions: self.legal_actions(seat),
            to_call,
        })
    }

    /// Public view plus the private view for `seat`; observers get an empty private part.
    pub fn get_state(&self, seat: Option<usize>) -> (PublicState, PrivateState) {
        let private = seat.and_then(|s| self.private_view(s)).unwrap_or_default();
        (self.public_view(), private)
    }
}

/// Returns (chips to pay, round contribution after paying).
fn validate_action(g: &GameState, seat: usize, action: ActionKind, amount: u64) -> Result<(u64, u64), EngineError> {
    if g.phase == Phase::Finished {
        return Err(EngineError::GameFinished);
    }
    let p = g
        .players
        .iter()
        .find(|p| p.seat == seat)
        .ok_or(EngineError::UnknownSeat(seat))?;
    if !g.phase.is_betting() || g.to_act != Some(seat) {
        return Err(EngineError::NotYourTurn { seat, to_act: g.to_act });
    }

    let rc = p.round_contribution;
    let to_call = g.current_bet.saturating_sub(rc);
    let max_to = rc + p.stack;
    let illegal = |reason: &'static str| -> Result<(u64, u64), EngineError> {
        Err(EngineError::IllegalAction { action, reason })
    };
    let in_range = |min: u64| -> Result<(u64, u64), EngineError> {
        if amount > max_to || (amount < min && amount != max_to) {
            Err(EngineError::InvalidAmount { amount, min, max: max_to })
        } else {
            Ok((amount - rc, amount))
        }
    };

    match action {
        ActionKind::Fold if to_call == 0 => illegal("nothing to call, check instead"),
        ActionKind::Fold => Ok((0, rc)),
        ActionKind::Check if to_call > 0 => illegal("facing a bet"),
        ActionKind::Check => Ok((0, rc)),
        ActionKind::Call if to_call == 0 => illegal("nothing to call"),
        ActionKind::Call => {
            let pay = to_call.min(p.stack);
            Ok((pay, rc + pay))
        }
        ActionKind::Bet if g.current_bet > 0 => illegal("a bet is already open, raise instead"),
        ActionKind::Bet => in_range(g.big_blind.min(max_to)),
        ActionKind::Raise if g.current_bet == 0 => illegal("no open bet, bet instead"),
        ActionKind::Raise if p.stack <= to_call => illegal("stack only covers a call"),
        ActionKind::Raise => in_range((g.current_bet + g.min_raise).min(max_to)),
        ActionKind::AllIn => Ok((p.stack, max_to)),
    }
}

fn commit(g: &mut GameState, seat: usize, amount: u64) -> u64 {
    if amount == 0 {
        return 0;
    }
    let Some(p) = g.players.iter_mut().find(|p| p.seat == seat) else {
        return 0;
    };
    let pay = amount.min(p.stack);
    p.stack -= pay;
    p.round_contribution += pay;
    p.hand_contribution += pay;
    if p.stack == 0 && p.status == PlayerStatus::Active {
        p.status = PlayerStatus::AllIn;
    }
    g.pot += pay;
    pay
}

/// First seat strictly after `from` (wrapping) that matches `pred`.
fn next_seat_where(g: &GameState, from: usize, pred: impl Fn(&PlayerState) -> bool) -> Option<usize> {
    g.players
        .iter()
        .find(|p| p.seat > from && pred(p))
        .or_else(|| g.players.iter().find(|p| p.seat <= from && pred(p)))
        .map(|p| p.seat)
}

fn is_active(p: &PlayerState) -> bool {
    p.status == PlayerStatus::Active
}

/// Resets per-hand state, moves the button, shuffles, deals and posts blinds.
/// Leaves the table `Finished` when fewer than two seats have chips.
fn deal_new_hand(g: &mut GameState) {
    for p in g.players.iter_mut() {
        p.hole.clear();
        p.round_contribution = 0;
        p.hand_contribution = 0;
        p.acted = false;
        p.status = if p.stack > 0 {
            PlayerStatus::Active
        } else {
            PlayerStatus::SittingOut
        };
    }
    g.board.clear();
    g.pot = 0;
    g.current_bet = 0;
    g.min_raise = g.big_blind;
    g.to_act = None;

    let funded = g.players.iter().filter(|p| is_active(p)).count();
    if funded < 2 {
        g.phase = Phase::Finished;
        g.deck.clear();
        return;
    }

    g.hand_number += 1;
    let from = if g.hand_number == 1 { 0 } else { g.dealer_seat };
    let Some(dealer) = next_seat_where(g, from, is_active) else {
        g.phase = Phase::Finished;
        return;
    };
    g.dealer_seat = dealer;
    let sb = if funded == 2 {
        dealer
    } else {
        next_seat_where(g, dealer, is_active).unwrap_or(dealer)
    };
    let bb = next_seat_where(g, sb, is_active).unwrap_or(sb);
    g.small_blind_seat = sb;
    g.big_blind_seat = bb;

    g.deck = g.seed.deck_for_hand(g.hand_number).cards;
    let mut order = Vec::with_capacity(funded);
    let mut cursor = dealer;
    for _ in 0..funded {
        if let Some(s) = next_seat_where(g, cursor, is_active) {
            order.push(s);
            cursor = s;
        }
    }
    for _ in 0..2 {
        for &seat in &order {
            let card = g.deck.pop();
            if let (Some(card), Some(p)) = (card, g.players.iter_mut().find(|p| p.seat == seat)) {
                p.hole.push(card);
            }
        }
    }

    let (small, big) = (g.small_blind, g.big_blind);
    commit(g, sb, small);
    commit(g, bb, big);
    g.current_bet = big;
    g.phase = Phase::Preflop;
}

enum Flow {
    NeedsAction,
    HandOver(HandResult),
}

/// Keeps going until someone has to act or the table is finished, starting
/// new hands as earlier ones end.
fn play_on(g: &mut GameState, mut cursor: usize) -> Vec<HandResult> {
    let mut finished = Vec::new();
    loop {
        if g.phase == Phase::Finished {
            return finished;
        }
        match advance_betting_turn(g, cursor) {
            Flow::NeedsAction => return finished,
            Flow::HandOver(result) => {
                g.last_result = Some(result.clone());
                finished.push(result);
                deal_new_hand(g);
                cursor = g.big_blind_seat;
            }
        }
    }
}

fn advance_betting_turn(g: &mut GameState, mut cursor: usize) -> Flow {
    loop {
        if g.players.iter().filter(|p| p.in_hand()).count() <= 1 {
            g.to_act = None;
            return Flow::HandOver(award_last_player_and_reset(g));
        }

        let lone = g.players.iter().filter(|p| is_active(p)).count() == 1;
        let bet = g.current_bet;
        let pending = next_seat_where(g, cursor, |p| {
            is_active(p) && (p.round_contribution < bet || (!p.acted && !lone))
        });
        if let Some(seat) = pending {
            g.to_act = Some(seat);
            return Flow::NeedsAction;
        }

        g.to_act = None;
        if !end_betting_round(g) {
            return Flow::HandOver(do_showdown(g));
        }
        cursor = g.dealer_seat;
    }
}

/// Closes the street and deals the next one. Returns false after the river.
fn end_betting_round(g: &mut GameState) -> bool {
    for p in g.players.iter_mut() {
        p.round_contribution = 0;
        p.acted = false;
    }
    g.current_bet = 0;
    g.min_raise = g.big_blind;

    let (next, cards) = match g.phase {
        Phase::Preflop => (Phase::Flop, 3),
        Phase::Flop => (Phase::Turn, 1),
        Phase::Turn => (Phase::River, 1),
        _ => {
            g.phase = Phase::Showdown;
            return false;
        }
    };
    // burn one
    g.deck.pop();
    for _ in 0..cards {
        if let Some(c) = g.deck.pop() {
            g.board.push(c);
        }
    }
    g.phase = next;
    true
}

/// Position for payout order: seat left of the dealer is 0, the dealer is last.
fn payout_order(g: &GameState, seat: usize) -> usize {
    let n = g.players.len();
    let pos = |s: usize| g.players.iter().position(|p| p.seat == s).unwrap_or(0);
    (pos(seat) + n - pos(g.dealer_seat) - 1) % n
}

fn collect_hand(g: &mut GameState) {
    g.pot = 0;
    for p in g.players.iter_mut() {
        p.round_contribution = 0;
        p.hand_contribution = 0;
    }
}

fn award_last_player_and_reset(g: &mut GameState) -> HandResult {
    let amount = g.pot;
    let winner = g.players.iter_mut().find(|p| p.in_hand());
    let payouts = match winner {
        Some(p) => {
            p.stack += amount;
            vec![Payout { seat: p.seat, amount, hand: None }]
        }
        None => vec![],
    };
    collect_hand(g);
    HandResult {
        hand_number: g.hand_number,
        board: g.board.clone(),
        payouts,
    }
}

fn do_showdown(g: &mut GameState) -> HandResult {
    g.phase = Phase::Showdown;
    let ranks: BTreeMap<usize, HandRank> = g
        .players
        .iter()
        .filter(|p| p.in_hand())
        .map(|p| {
            let mut cards = p.hole.clone();
            cards.extend_from_slice(&g.board);
            let rank = best_hand(&cards).unwrap_or(HandRank::HighCard([Rank::Two; 5]));
            (p.seat, rank)
        })
        .collect();

    let contributions: Vec<(usize, u64, bool)> = g
        .players
        .iter()
        .map(|p| (p.seat, p.hand_contribution, p.in_hand()))
        .collect();

    let mut won: BTreeMap<usize, u64> = BTreeMap::new();
    for pot in side_pots(&contributions) {
        let Some(best) = pot.eligible.iter().filter_map(|s| ranks.get(s)).max() else {
            continue;
        };
        let mut winners: Vec<usize> = pot
            .eligible
            .iter()
            .copied()
            .filter(|s| ranks.get(s) == Some(best))
            .collect();
        winners.sort_by_key(|s| payout_order(g, *s));
        for (seat, chips) in split(pot.amount, &winners) {
            *won.entry(seat).or_default() += chips;
        }
    }

    for (seat, chips) in &won {
        if let Some(p) = g.players.iter_mut().find(|p| p.seat == *seat) {
            p.stack += chips;
        }
    }
    collect_hand(g);

    HandResult {
        hand_number: g.hand_number,
        board: g.board.clone(),
        payouts: won
            .into_iter()
            .map(|(seat, amount)| Payout {
                seat,
                amount,
                hand: ranks.get(&seat).map(|r| r.name().to_string()),
            })
            .collect(),
    }
}
