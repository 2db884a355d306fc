use log::info;

use crate::error::RoleError;
use crate::types::Role;

/// Result of a promotion request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    Promoted { from: Role },
    AlreadyPrimary,
}

/// Role state machine for one broker.
///
/// ```text
///   BACKUP <-> CATCHUP
///      \         /
///       PRIMARY (terminal)
/// ```
#[derive(Debug)]
pub struct RoleMachine {
    role: Role,
}

impl RoleMachine {
    /// Every broker starts as a backup.
    pub fn new() -> Self {
        RoleMachine { role: Role::Backup }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn promote(&mut self) -> Promotion {
        match self.role {
            Role::Primary => Promotion::AlreadyPrimary,
            from => {
                self.role = Role::Primary;
                info!("Role {} -> {}", from, Role::Primary);
                Promotion::Promoted { from }
            }
        }
    }

    /// A backup started building mirrors. Repeating it while in catch-up is a no-op.
    pub fn begin_catchup(&mut self) -> Result<bool, RoleError> {
        self.transition(Role::Catchup)
    }

    /// All mirrors are ready. Repeating it while a backup is a no-op.
    pub fn catchup_complete(&mut self) -> Result<bool, RoleError> {
        self.transition(Role::Backup)
    }

    fn transition(&mut self, to: Role) -> Result<bool, RoleError> {
        match (self.role, to) {
            (from, to) if from == to => Ok(false),
            (Role::Backup, Role::Catchup) | (Role::Catchup, Role::Backup) => {
                info!("Role {} -> {}", self.role, to);
                self.role = to;
                Ok(true)
            }
            (from, to) => Err(RoleError { from, to }),
        }
    }
}

impl Default for RoleMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_as_backup() {
        assert_eq!(RoleMachine::new().role(), Role::Backup);
    }

    #[test]
    fn test_catchup_round_trip() {
        let mut machine = RoleMachine::new();
        assert_eq!(machine.begin_catchup(), Ok(true));
        assert_eq!(machine.begin_catchup(), Ok(false));
        assert_eq!(machine.role(), Role::Catchup);
        assert_eq!(machine.catchup_complete(), Ok(true));
        assert_eq!(machine.role(), Role::Backup);
    }

    #[test]
    fn test_promote_is_idempotent() {
        let mut machine = RoleMachine::new();
        assert_eq!(machine.promote(), Promotion::Promoted { from: Role::Backup });
        assert_eq!(machine.promote(), Promotion::AlreadyPrimary);
        assert_eq!(machine.role(), Role::Primary);
    }

    #[test]
    fn test_promote_from_catchup() {
        let mut machine = RoleMachine::new();
        machine.begin_catchup().unwrap();
        assert_eq!(machine.promote(), Promotion::Promoted { from: Role::Catchup });
    }

    #[test]
    fn test_primary_is_terminal() {
        let mut machine = RoleMachine::new();
        machine.promote();
        assert_eq!(
            machine.begin_catchup(),
            Err(RoleError { from: Role::Primary, to: Role::Catchup })
        );
        assert_eq!(
            machine.catchup_complete(),
            Err(RoleError { from: Role::Primary, to: Role::Backup })
        );
        assert_eq!(machine.role(), Role::Primary);
    }
}
