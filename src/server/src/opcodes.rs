// Operation codes for the client wire protocol

// Connection setup
pub const OP_CONNECT: u16 = 1;       // body: client | replication | admin
pub const OP_CONNECT_OK: u16 = 2;    // body: current role
pub const OP_EXCLUDED: u16 = 3;      // body: exclusion reason, connection closes

// Queue operations
pub const OP_DECLARE: u16 = 10;
pub const OP_DELETE: u16 = 11;
pub const OP_ENQUEUE: u16 = 12;
pub const OP_ENQUEUE_OK: u16 = 13;   // body: assigned position
pub const OP_DEQUEUE: u16 = 14;
pub const OP_EMPTY: u16 = 15;

pub const OP_ERROR: u16 = 19;

// Status and metrics
pub const OP_STATUS: u16 = 20;
pub const OP_METRICS: u16 = 21;
pub const OP_PING: u16 = 22;         // body: responding members, newline separated

// Management
pub const OP_MANAGE: u16 = 30;         // queue: method name, body: argument
pub const OP_MANAGE_RESULT: u16 = 31;  // queue: status code, body: status text

pub fn name(code: u16) -> &'static str {
    match code {
        OP_CONNECT => "CONNECT",
        OP_CONNECT_OK => "CONNECT_OK",
        OP_EXCLUDED => "EXCLUDED",
        OP_DECLARE => "DECLARE",
        OP_DELETE => "DELETE",
        OP_ENQUEUE => "ENQUEUE",
        OP_ENQUEUE_OK => "ENQUEUE_OK",
        OP_DEQUEUE => "DEQUEUE",
        OP_EMPTY => "EMPTY",
        OP_ERROR => "ERROR",
        OP_STATUS => "STATUS",
        OP_METRICS => "METRICS",
        OP_PING => "PING",
        OP_MANAGE => "MANAGE",
        OP_MANAGE_RESULT => "MANAGE_RESULT",
        _ => "UNKNOWN",
    }
}
