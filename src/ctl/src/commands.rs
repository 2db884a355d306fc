// Command name constants

// Management commands
pub const COMMAND_PROMOTE: &str = "promote";
pub const COMMAND_SET_CLIENT_ADDRESSES: &str = "set-client-addresses";
pub const COMMAND_SET_BROKER_ADDRESSES: &str = "set-broker-addresses";

// Status commands
pub const COMMAND_STATUS: &str = "status";
pub const COMMAND_METRICS: &str = "metrics";
pub const COMMAND_PING: &str = "ping";

// Queue commands
pub const COMMAND_DECLARE: &str = "declare";
pub const COMMAND_DELETE: &str = "delete";
pub const COMMAND_SEND: &str = "send";
pub const COMMAND_RECEIVE: &str = "receive";

// Local settings
pub const COMMAND_CONFIG: &str = "config";

/// Management method invoked by a command, if it is a management command
pub fn management_method(command: &str) -> Option<&'static str> {
    match command {
        COMMAND_PROMOTE => Some("promote"),
        COMMAND_SET_CLIENT_ADDRESSES => Some("setClientAddresses"),
        COMMAND_SET_BROKER_ADDRESSES => Some("setBrokerAddresses"),
        _ => None,
    }
}

/// Connection kind a command announces in its CONNECT preamble
pub fn connection_kind(command: &str) -> &'static str {
    match command {
        COMMAND_DECLARE | COMMAND_DELETE | COMMAND_SEND | COMMAND_RECEIVE => "client",
        _ => "admin",
    }
}
