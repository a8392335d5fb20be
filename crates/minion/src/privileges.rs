//! Dropping root privileges after bind

use crate::{MinionError, Result};
use nix::unistd::{setgid, setuid, Group, User};
use tracing::info;

/// Switch to `group` and then `user`
///
/// With only `user` given, the user's primary group is used. Nothing happens
/// when both are unset.
pub fn switch_user(user: Option<&str>, group: Option<&str>) -> Result<()> {
    let user = user.map(lookup_user).transpose()?;
    let group = group.map(lookup_group).transpose()?;

    let gid = group
        .as_ref()
        .map(|g| g.gid)
        .or_else(|| user.as_ref().map(|u| u.gid));
    if let Some(gid) = gid {
        setgid(gid)?;
    }

    if let Some(user) = user {
        setuid(user.uid)?;
        info!("Running as {} ({})", user.name, user.uid);
    }

    Ok(())
}

fn lookup_user(name: &str) -> Result<User> {
    User::from_name(name)?.ok_or_else(|| MinionError::Config(format!("unknown user `{}`", name)))
}

fn lookup_group(name: &str) -> Result<Group> {
    Group::from_name(name)?.ok_or_else(|| MinionError::Config(format!("unknown group `{}`", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_switch_requested() {
        assert!(switch_user(None, None).is_ok());
    }

    #[test]
    fn test_unknown_user_is_config_error() {
        let result = switch_user(Some("no-such-minion-user"), None);
        assert!(matches!(result, Err(MinionError::Config(_))));
    }

    #[test]
    fn test_unknown_group_is_config_error() {
        let result = switch_user(None, Some("no-such-minion-group"));
        assert!(matches!(result, Err(MinionError::Config(_))));
    }
}
