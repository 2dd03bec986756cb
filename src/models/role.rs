use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// User roles, declared lowest to highest. The derived `Ord` is the role
/// hierarchy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "user_role", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Rider,
    Volunteer,
    Police,
    Commander,
    Admin,
    SuperAdmin,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Rider,
        Role::Volunteer,
        Role::Police,
        Role::Commander,
        Role::Admin,
        Role::SuperAdmin,
    ];

    /// Roles that get a system-wide group conversation.
    pub const GROUP_ROLES: [Role; 5] = [
        Role::Rider,
        Role::Volunteer,
        Role::Police,
        Role::Commander,
        Role::Admin,
    ];

    /// Integer rank, rider = 1 through super_admin = 6.
    pub fn level(self) -> u8 {
        self as u8 + 1
    }

    /// True when a holder of `self` meets a bar of `minimum`.
    pub fn satisfies(self, minimum: Role) -> bool {
        self >= minimum
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Rider => "rider",
            Role::Volunteer => "volunteer",
            Role::Police => "police",
            Role::Commander => "commander",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }

    /// Title of the role group conversation for this role.
    pub fn group_title(self) -> &'static str {
        match self {
            Role::Rider => "Riders",
            Role::Volunteer => "Volunteers",
            Role::Police => "Police",
            Role::Commander => "Commanders",
            Role::Admin => "Admins",
            Role::SuperAdmin => "Super Admins",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown role: {}", self.0)
    }
}

impl std::error::Error for UnknownRole {}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}
