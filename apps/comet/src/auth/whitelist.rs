use std::collections::HashSet;

/// Yes/no predicate on an authenticated user id. A `false` answer fails the
/// channel's authentication.
pub trait Whitelist: Send + Sync {
    fn is_whitelisted(&self, user_id: &str) -> bool;
}

/// Admits every user.
pub struct AllowAll;

impl Whitelist for AllowAll {
    fn is_whitelisted(&self, _user_id: &str) -> bool {
        true
    }
}

/// Admits only the configured user ids.
pub struct StaticWhitelist {
    users: HashSet<String>,
}

impl StaticWhitelist {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            users: users.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Whitelist for StaticWhitelist {
    fn is_whitelisted(&self, user_id: &str) -> bool {
        self.users.contains(user_id)
    }
}
