//! Path-component and host account helpers.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use nix::unistd::Gid;
use nix::unistd::Group;
use nix::unistd::Uid;
use nix::unistd::User;
use nix::unistd::getgid;
use nix::unistd::getuid;

/// The directory component of an absolute path (`/a/b` -> `/a`).
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// The file-name component of an absolute path (`/a/b` -> `b`). The root
/// yields the empty string, matching the root row's name.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// The non-empty `/`-separated segments of a path, in order.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// Resolves a uid to its account name in the host user database.
pub fn username(uid: u32) -> Option<String> {
    User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|user| user.name)
}

/// Resolves a gid to its group name in the host group database.
pub fn groupname(gid: u32) -> Option<String> {
    Group::from_gid(Gid::from_raw(gid)).ok().flatten().map(|group| group.name)
}

/// Resolves an account name to its uid.
pub fn user_id(name: &str) -> Option<u32> {
    User::from_name(name).ok().flatten().map(|user| user.uid.as_raw())
}

/// Resolves a group name to its gid.
pub fn group_id(name: &str) -> Option<u32> {
    Group::from_name(name).ok().flatten().map(|group| group.gid.as_raw())
}

/// The name of the user running this process, or the numeric uid when the
/// uid has no passwd entry.
pub fn process_username() -> String {
    let uid = getuid();
    username(uid.as_raw()).unwrap_or_else(|| uid.as_raw().to_string())
}

/// The name of the group running this process, or the numeric gid.
pub fn process_groupname() -> String {
    let gid = getgid();
    groupname(gid.as_raw()).unwrap_or_else(|| gid.as_raw().to_string())
}

/// Seconds since the Unix epoch.
pub fn now_epoch() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirname_components() {
        assert_eq!(dirname("/a/b/c"), "/a/b");
        assert_eq!(dirname("/a"), "/");
        assert_eq!(dirname("/"), "/");
    }

    #[test]
    fn basename_components() {
        assert_eq!(basename("/a/b/c"), "c");
        assert_eq!(basename("/a"), "a");
        assert_eq!(basename("/"), "");
    }

    #[test]
    fn segments_skip_empty_parts() {
        let parts: Vec<&str> = segments("/a/b/c").collect();
        assert_eq!(parts, vec!["a", "b", "c"]);
        assert_eq!(segments("/").count(), 0);
        assert_eq!(segments("").count(), 0);
        let doubled: Vec<&str> = segments("//a//b").collect();
        assert_eq!(doubled, vec!["a", "b"]);
    }

    #[test]
    fn process_names_are_nonempty() {
        assert!(!process_username().is_empty());
        assert!(!process_groupname().is_empty());
    }
}
