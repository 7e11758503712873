//! Command names reserved by the cluster protocol.

use beege_core::Role;

/// Peer liveness ping carrying the sender's address.
pub const HEARTBEAT: &str = "heartbeat";

/// Docker announces its address to a controller it dialed.
pub const DOCKER_GREETINGS: &str = "docker_greetings";
/// Result name answering `docker_greetings`.
pub const DOCKER_GREETINGS_REPLY: &str = "docker_greetings_reply";

/// Docker bootstrap request.
pub const DOCKER_JOIN_CLUSTER: &str = "docker_join_cluster";
/// Result name answering `docker_join_cluster`.
pub const DOCKER_JOIN: &str = "docker_join";

/// Controller bootstrap request; also gossiped to dockers when a new
/// controller joins.
pub const CONTROLLER_JOIN_CLUSTER: &str = "controller_join_cluster";
/// Result name answering `controller_join_cluster`.
pub const CONTROLLER_JOIN: &str = "controller_join";
/// Older name of the new-controller notice sent to dockers.
pub const CONTROLLER_JOIN_TO_DOCKER: &str = "controller_join_to_docker";

/// A docker lost its connection to the controller named in the payload.
pub const CONTROLLER_OFFLINE: &str = "controller_offline";

pub const DOCKER_STATUS: &str = "docker_status";
pub const DOCKER_EVENT: &str = "docker_event";
pub const DOCKER_IMAGES: &str = "docker_images";
pub const DOCKER_CONTAINERS: &str = "docker_containers";

/// Local peer-loss notification. Never sent over the wire and never
/// accepted as a handler name.
pub const DISCONNECT: &str = "disconnect";

/// Payload of the FAILURE reply to an unknown command.
pub const UNKNOWN_COMMAND_MESSAGE: &str = "Command does not exist";

/// Bootstrap request sent by a node of the given role.
pub fn join_command(role: Role) -> &'static str {
    match role {
        Role::Controller => CONTROLLER_JOIN_CLUSTER,
        Role::Docker => DOCKER_JOIN_CLUSTER,
    }
}

/// Result name expected in reply to [`join_command`].
pub fn join_reply(role: Role) -> &'static str {
    match role {
        Role::Controller => CONTROLLER_JOIN,
        Role::Docker => DOCKER_JOIN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_names_are_role_tagged() {
        assert_eq!(join_command(Role::Controller), "controller_join_cluster");
        assert_eq!(join_command(Role::Docker), "docker_join_cluster");
        assert!(join_reply(Role::Docker).starts_with(Role::Docker.as_str()));
        assert!(join_reply(Role::Controller).starts_with(Role::Controller.as_str()));
    }
}
