/// Player commands and count payloads.
pub mod command;
/// CoRE link-format parsing for directory listings.
pub mod link_format;
