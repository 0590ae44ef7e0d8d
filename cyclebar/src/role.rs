use std::fmt;

/// What an opener is allowed to do with the shared barrier.
///
/// The leader creates the shared state and tears it down on close. Followers
/// only attach to what a leader has published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    /// Maps the scalar "is leader" flag used by foreign callers.
    pub fn from_flag(is_leader: bool) -> Self {
        if is_leader {
            Role::Leader
        } else {
            Role::Follower
        }
    }

    pub fn is_leader(self) -> bool {
        self == Role::Leader
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => f.write_str("leader"),
            Role::Follower => f.write_str("follower"),
        }
    }
}
