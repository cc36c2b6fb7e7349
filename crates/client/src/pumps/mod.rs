pub(crate) mod keepalive;
pub(crate) mod write;
