use lazy_static::lazy_static;
use std::time::Duration;

pub struct Config {
    pub default_mailbox_size: usize,
    pub idle_timeout: Duration,
    pub drain_timeout: Duration,
}

lazy_static! {
    pub static ref CONFIG: Config = Config {
        default_mailbox_size: 42,
        idle_timeout: Duration::from_secs(60),
        drain_timeout: Duration::from_secs(5),
    };
}
