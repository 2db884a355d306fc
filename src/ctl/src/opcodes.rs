// Operation codes (same as server)

pub const OP_CONNECT: u16 = 1;
pub const OP_CONNECT_OK: u16 = 2;
pub const OP_EXCLUDED: u16 = 3;

pub const OP_DECLARE: u16 = 10;
pub const OP_DELETE: u16 = 11;
pub const OP_ENQUEUE: u16 = 12;
pub const OP_ENQUEUE_OK: u16 = 13;
pub const OP_DEQUEUE: u16 = 14;
pub const OP_EMPTY: u16 = 15;

pub const OP_ERROR: u16 = 19;

pub const OP_STATUS: u16 = 20;
pub const OP_METRICS: u16 = 21;
pub const OP_PING: u16 = 22;

pub const OP_MANAGE: u16 = 30;
pub const OP_MANAGE_RESULT: u16 = 31;
