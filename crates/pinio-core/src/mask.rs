//! Per-pin bitmasks.
//!
//! The same type carries three things: which actions have an OS-level
//! operation outstanding (in-progress), which callbacks are executing
//! (invoking), and why a pin was closed (action bits plus reason bits).

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ActionMask(u32);

impl ActionMask {
    pub const NONE: ActionMask = ActionMask(0);

    // Action bits
    pub const ACCEPT: ActionMask = ActionMask(1 << 0);
    pub const CONNECT: ActionMask = ActionMask(1 << 1);
    pub const SEND: ActionMask = ActionMask(1 << 2);
    pub const RECV: ActionMask = ActionMask(1 << 3);

    // Reason bits
    pub const TIMEOUT: ActionMask = ActionMask(1 << 8);
    pub const PEER_CLOSED: ActionMask = ActionMask(1 << 9);
    pub const ERROR: ActionMask = ActionMask(1 << 10);
    pub const USER: ActionMask = ActionMask(1 << 11);
    pub const NO_MEMORY: ActionMask = ActionMask(1 << 12);
    pub const SHUTDOWN: ActionMask = ActionMask(1 << 13);

    const ACTIONS: u32 = 0xff;

    const NAMES: [(ActionMask, &'static str); 10] = [
        (Self::ACCEPT, "ACCEPT"),
        (Self::CONNECT, "CONNECT"),
        (Self::SEND, "SEND"),
        (Self::RECV, "RECV"),
        (Self::TIMEOUT, "TIMEOUT"),
        (Self::PEER_CLOSED, "PEER_CLOSED"),
        (Self::ERROR, "ERROR"),
        (Self::USER, "USER"),
        (Self::NO_MEMORY, "NO_MEMORY"),
        (Self::SHUTDOWN, "SHUTDOWN"),
    ];

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` are set.
    #[inline]
    pub const fn contains(self, other: ActionMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set.
    #[inline]
    pub const fn intersects(self, other: ActionMask) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: ActionMask) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: ActionMask) {
        self.0 &= !other.0;
    }

    #[inline]
    pub const fn actions(self) -> ActionMask {
        ActionMask(self.0 & Self::ACTIONS)
    }

    #[inline]
    pub const fn reasons(self) -> ActionMask {
        ActionMask(self.0 & !Self::ACTIONS)
    }
}

impl BitOr for ActionMask {
    type Output = ActionMask;

    #[inline]
    fn bitor(self, rhs: ActionMask) -> ActionMask {
        ActionMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for ActionMask {
    #[inline]
    fn bitor_assign(&mut self, rhs: ActionMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ActionMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (bit, name) in Self::NAMES {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ActionMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActionMask({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let mut m = ActionMask::NONE;
        m.insert(ActionMask::RECV);
        m |= ActionMask::SEND;
        assert!(m.contains(ActionMask::RECV | ActionMask::SEND));
        m.remove(ActionMask::RECV);
        assert!(!m.intersects(ActionMask::RECV));
        assert!(m.intersects(ActionMask::SEND | ActionMask::RECV));
    }

    #[test]
    fn test_split_actions_reasons() {
        let m = ActionMask::RECV | ActionMask::TIMEOUT;
        assert_eq!(m.actions(), ActionMask::RECV);
        assert_eq!(m.reasons(), ActionMask::TIMEOUT);
    }

    #[test]
    fn test_display() {
        assert_eq!(ActionMask::NONE.to_string(), "NONE");
        assert_eq!(
            (ActionMask::RECV | ActionMask::PEER_CLOSED).to_string(),
            "RECV|PEER_CLOSED"
        );
    }
}
