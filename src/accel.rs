//! Accelerated-function table (§9): a hook point for substituting known
//! hot routines with native equivalents, installed by index via
//! `accelfunc`/`accelparam`. The bodies of individual accelerants are
//! out of scope (§1's Non-goal) — this module only provides the
//! indexed-table plumbing a host or embedder would plug them into.

use std::collections::HashMap;

/// A native accelerant: given its parameter slots and the function's
/// call arguments, produce the return value a bytecode call to the same
/// address would have produced.
pub type Accelerant = fn(params: &[u32], args: &[u32]) -> u32;

/// Maps accelerated function *numbers* (not addresses) to native
/// routines, and tracks each number's installed parameter words
/// (`accelparam`).
#[derive(Default)]
pub struct AccelTable {
    funcs: HashMap<u32, Accelerant>,
    /// Address -> accelerated function number, set by `accelfunc`.
    addr_to_index: HashMap<u32, u32>,
    params: HashMap<u32, Vec<u32>>,
}

impl AccelTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native implementation for accelerated-function number
    /// `index`. Distinct from `install`, which binds a bytecode address
    /// to that number — a host registers implementations once at
    /// startup, then the story file's `accelfunc` calls bind addresses.
    pub fn register(&mut self, index: u32, f: Accelerant) {
        self.funcs.insert(index, f);
    }

    /// `accelfunc`: bind `addr` to accelerated-function number `index`.
    /// `index == 0` removes any existing binding for `addr`.
    pub fn install(&mut self, index: u32, addr: u32) {
        if index == 0 {
            self.addr_to_index.remove(&addr);
        } else {
            self.addr_to_index.insert(addr, index);
        }
    }

    /// `accelparam`: set parameter word `slot` for accelerated function
    /// `index`.
    pub fn set_param(&mut self, index: u32, slot: u32, value: u32) {
        let params = self.params.entry(index).or_default();
        if slot as usize >= params.len() {
            params.resize(slot as usize + 1, 0);
        }
        params[slot as usize] = value;
    }

    /// Whether `addr` has an accelerated implementation bound (used to
    /// answer the `AccelFunc` gestalt selector).
    #[must_use]
    pub fn is_installed(&self, addr: u32) -> bool {
        self.addr_to_index
            .get(&addr)
            .is_some_and(|idx| self.funcs.contains_key(idx))
    }

    /// Invoke the accelerant bound to `addr` with the given call
    /// arguments, if one is installed.
    #[must_use]
    pub fn call(&self, addr: u32, args: &[u32]) -> Option<u32> {
        let index = *self.addr_to_index.get(&addr)?;
        let f = self.funcs.get(&index)?;
        let empty = Vec::new();
        let params = self.params.get(&index).unwrap_or(&empty);
        Some(f(params, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_args(_params: &[u32], args: &[u32]) -> u32 {
        args.iter().sum()
    }

    #[test]
    fn installed_address_dispatches_to_registered_accelerant() {
        let mut table = AccelTable::new();
        table.register(1, sum_args);
        table.install(1, 0x1000);
        assert_eq!(table.call(0x1000, &[2, 3, 4]), Some(9));
    }

    #[test]
    fn uninstalled_address_returns_none() {
        let table = AccelTable::new();
        assert_eq!(table.call(0x2000, &[]), None);
    }

    #[test]
    fn installing_index_zero_removes_binding() {
        let mut table = AccelTable::new();
        table.register(1, sum_args);
        table.install(1, 0x1000);
        table.install(0, 0x1000);
        assert_eq!(table.call(0x1000, &[1]), None);
        assert!(!table.is_installed(0x1000));
    }

    #[test]
    fn params_are_visible_to_the_accelerant() {
        fn uses_param(params: &[u32], args: &[u32]) -> u32 {
            params.first().copied().unwrap_or(0) + args[0]
        }
        let mut table = AccelTable::new();
        table.register(2, uses_param);
        table.install(2, 0x3000);
        table.set_param(2, 0, 100);
        assert_eq!(table.call(0x3000, &[5]), Some(105));
    }
}
