//! Topic names used on a server's event bus.

pub const CONSOLE_OUTPUT: &str = "console output";
pub const STATUS: &str = "status";
pub const STATS: &str = "stats";
pub const DAEMON_MESSAGE: &str = "daemon message";
pub const DAEMON_ERROR: &str = "daemon error";
pub const INSTALL_OUTPUT: &str = "install output";
pub const INSTALL_STARTED: &str = "install started";
pub const INSTALL_COMPLETED: &str = "install completed";
pub const BACKUP_COMPLETED: &str = "backup completed";
pub const BACKUP_RESTORE_COMPLETED: &str = "backup restore completed";
pub const TRANSFER_LOGS: &str = "transfer logs";
pub const TRANSFER_STATUS: &str = "transfer status";
pub const FEATURE_MATCH: &str = "feature match";

/// Docker image pull progress topics emitted by the container environment.
pub const DOCKER_IMAGE_PULL_STARTED: &str = "docker image pull started";
pub const DOCKER_IMAGE_PULL_STATUS: &str = "docker image pull status";
pub const DOCKER_IMAGE_PULL_COMPLETED: &str = "docker image pull completed";
