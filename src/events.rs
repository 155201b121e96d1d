use std::fmt;

use serde::{Deserialize, Serialize};

// Add prefix to avoid conflict with actual Git repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubRepository {
    /// Full name of the repository, e.g. "octocat/hello-world".
    pub full_name: String,
    /// Name of the repository, e.g. "hello-world".
    pub name: String,
    #[serde(default)]
    pub owner: User,
}

impl GithubRepository {
    /// Owner login, falling back to the part before `/` of the full name.
    pub fn owner(&self) -> &str {
        if self.owner.login.is_empty() {
            self.full_name
                .split_once('/')
                .map_or("", |(owner, _)| owner)
        } else {
            &self.owner.login
        }
    }

    /// Only ASCII alphanumerics, `-` and `_` are accepted as a repository name.
    pub fn has_valid_name(&self) -> bool {
        !self.name.is_empty()
            && self
                .name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }
}

impl fmt::Display for GithubRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Name of the user or organization e.g. "octocat".
    pub login: String,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn repo(name: &str) -> GithubRepository {
        GithubRepository {
            full_name: format!("octocat/{name}"),
            name: name.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn valid_names() {
        for name in ["hello-world", "hello_world", "Repo42", "a"] {
            assert!(repo(name).has_valid_name(), "{name}");
        }
    }

    #[test]
    fn invalid_names() {
        for name in ["bad repo", "", "dot.repo", "semi;colon", "slash/name", "ünï"] {
            assert!(!repo(name).has_valid_name(), "{name}");
        }
    }

    #[test]
    fn owner_from_full_name() {
        assert_eq!(repo("hello").owner(), "octocat");

        let mut r = repo("hello");
        r.owner.login = "someone".to_owned();
        assert_eq!(r.owner(), "someone");
    }
}
