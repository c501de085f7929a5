//! Partitioning an expense total into per-participant shares.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::money::Money;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitPolicy {
    /// Even split. With `include_payer = false` the payer keeps a zero share and the
    /// total is divided among the other participants.
    Equal { include_payer: bool },
    /// Explicit amount per participant; must cover every participant and sum to the
    /// total exactly.
    Custom { amounts: HashMap<Uuid, Money> },
}

/// A share as produced at creation time, before any payment exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareDraft {
    pub user_id: Uuid,
    pub assigned_amount: Money,
    /// The payer's own share starts settled: nobody owes money to themselves.
    pub prepaid: bool,
}

/// Splits `total` among `participants` (in the given order) under `policy`.
///
/// Leftover minor units of an equal split go first to the payer's position and then
/// onward in list order, wrapping. When the payer is excluded they start at the
/// participant right after the payer.
pub fn split_expense(
    total: Money,
    payer_id: Uuid,
    participants: &[Uuid],
    policy: &SplitPolicy,
) -> Result<Vec<ShareDraft>> {
    if !total.is_positive() {
        return Err(LedgerError::InvalidAmount(format!(
            "expense total must be positive, got {total}"
        )));
    }
    let payer_position = validate_participants(payer_id, participants)?;

    let amounts = match policy {
        SplitPolicy::Equal { include_payer: true } => {
            total.split_even(participants.len(), payer_position)?
        }
        SplitPolicy::Equal {
            include_payer: false,
        } => {
            let debtors = participants.len() - 1;
            if debtors == 0 {
                return Err(LedgerError::InvalidParticipants {
                    reason: "the payer cannot be excluded when they are the only participant",
                    user_id: Some(payer_id),
                });
            }
            // Participants before the payer keep their index, so the one right after
            // the payer lands on `payer_position` once the payer is removed.
            let mut amounts = total.split_even(debtors, payer_position % debtors)?;
            amounts.insert(payer_position, Money::zero(total.currency()));
            amounts
        }
        SplitPolicy::Custom { amounts } => custom_amounts(total, participants, amounts)?,
    };

    Ok(participants
        .iter()
        .zip(amounts)
        .map(|(&user_id, assigned_amount)| ShareDraft {
            user_id,
            assigned_amount,
            prepaid: user_id == payer_id,
        })
        .collect())
}

fn validate_participants(payer_id: Uuid, participants: &[Uuid]) -> Result<usize> {
    if participants.is_empty() {
        return Err(LedgerError::InvalidParticipants {
            reason: "participant list is empty",
            user_id: None,
        });
    }
    let mut seen = HashSet::with_capacity(participants.len());
    for user_id in participants {
        if !seen.insert(*user_id) {
            return Err(LedgerError::InvalidParticipants {
                reason: "participant listed more than once",
                user_id: Some(*user_id),
            });
        }
    }
    participants
        .iter()
        .position(|user_id| *user_id == payer_id)
        .ok_or(LedgerError::InvalidParticipants {
            reason: "payer must be one of the participants",
            user_id: Some(payer_id),
        })
}

fn custom_amounts(
    total: Money,
    participants: &[Uuid],
    amounts: &HashMap<Uuid, Money>,
) -> Result<Vec<Money>> {
    if let Some(stranger) = amounts.keys().find(|id| !participants.contains(*id)) {
        return Err(LedgerError::InvalidParticipants {
            reason: "custom amount given for a non-participant",
            user_id: Some(*stranger),
        });
    }

    let mut assigned = Vec::with_capacity(participants.len());
    for user_id in participants {
        let amount = amounts
            .get(user_id)
            .copied()
            .ok_or(LedgerError::InvalidParticipants {
                reason: "participant has no custom amount",
                user_id: Some(*user_id),
            })?;
        if amount.currency() != total.currency() {
            return Err(LedgerError::InvalidAmount(format!(
                "amount {amount} is not in {}",
                total.currency()
            )));
        }
        if amount.is_negative() {
            return Err(LedgerError::InvalidAmount(format!(
                "custom amount for {user_id} is negative: {amount}"
            )));
        }
        assigned.push(amount);
    }

    let actual = Money::sum(total.currency(), assigned.iter().copied())?;
    if actual != total {
        return Err(LedgerError::SplitSumMismatch {
            expected: total,
            actual,
        });
    }
    Ok(assigned)
}
