use std::collections::BTreeSet;
use std::fmt;

/// Identity of a simulated borrower. Account 0 is the whale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountId(pub u32);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Inactive,
    Active,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,
    pub status: AccountStatus,
    /// Collateral ratio the borrower steers towards, drawn when the trove opens
    pub target_cr: f64,
    /// Relative ratio drift the borrower tolerates before acting
    pub inattention: f64,
    pub opened_in: Option<u64>,
    pub deactivated_in: Option<u64>,
}

impl Account {
    fn new(id: AccountId) -> Self {
        Account {
            id,
            status: AccountStatus::Inactive,
            target_cr: 0.0,
            inattention: 0.0,
            opened_in: None,
            deactivated_in: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Relative deviation of the current ratio from the target.
    pub fn deviation(&self, icr: f64) -> f64 {
        if self.target_cr <= 0.0 {
            return 0.0;
        }
        (icr - self.target_cr) / self.target_cr
    }
}

/// The full account pool, partitioned into active and inactive sets.
///
/// `active` keeps activation order, which is what the step functions iterate;
/// `inactive` is ordered by id so sampling is reproducible.
#[derive(Debug, Clone)]
pub struct AccountPool {
    accounts: Vec<Account>,
    active: Vec<AccountId>,
    inactive: BTreeSet<AccountId>,
}

impl AccountPool {
    pub const WHALE: AccountId = AccountId(0);

    pub fn new(size: usize) -> Self {
        let accounts: Vec<Account> = (0..size as u32).map(|i| Account::new(AccountId(i))).collect();
        let inactive = accounts.iter().map(|a| a.id).collect();
        AccountPool {
            accounts,
            active: Vec::new(),
            inactive,
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn get(&self, id: AccountId) -> Option<&Account> {
        self.accounts.get(id.0 as usize)
    }

    pub fn active(&self) -> &[AccountId] {
        &self.active
    }

    pub fn inactive(&self) -> Vec<AccountId> {
        self.inactive.iter().copied().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn inactive_count(&self) -> usize {
        self.inactive.len()
    }

    pub fn is_active(&self, id: AccountId) -> bool {
        self.get(id).map(|a| a.is_active()).unwrap_or(false)
    }

    /// Active accounts other than the whale.
    pub fn borrowers(&self) -> Vec<AccountId> {
        self.active
            .iter()
            .copied()
            .filter(|id| *id != Self::WHALE)
            .collect()
    }

    /// Move an inactive account into the active set with freshly drawn traits.
    /// Returns false if the account is unknown or already active.
    pub fn activate(&mut self, id: AccountId, target_cr: f64, inattention: f64, period: u64) -> bool {
        if !self.inactive.remove(&id) {
            return false;
        }
        let account = &mut self.accounts[id.0 as usize];
        account.status = AccountStatus::Active;
        account.target_cr = target_cr;
        account.inattention = inattention;
        account.opened_in = Some(period);
        account.deactivated_in = None;
        self.active.push(id);
        true
    }

    /// Move an active account back to the inactive set.
    /// Returns false if the account was not active.
    pub fn deactivate(&mut self, id: AccountId, period: u64) -> bool {
        let Some(pos) = self.active.iter().position(|a| *a == id) else {
            return false;
        };
        self.active.remove(pos);
        self.inactive.insert(id);
        let account = &mut self.accounts[id.0 as usize];
        account.status = AccountStatus::Inactive;
        account.deactivated_in = Some(period);
        true
    }

    /// Active and inactive sets are disjoint, cover every account, and agree
    /// with each account's status flag.
    pub fn is_partitioned(&self) -> bool {
        if self.active.len() + self.inactive.len() != self.accounts.len() {
            return false;
        }
        let active: BTreeSet<AccountId> = self.active.iter().copied().collect();
        if active.len() != self.active.len() {
            return false;
        }
        self.accounts.iter().all(|a| {
            let in_active = active.contains(&a.id);
            let in_inactive = self.inactive.contains(&a.id);
            in_active != in_inactive && in_active == a.is_active()
        })
    }
}
