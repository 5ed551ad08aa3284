// lobster-runtime: host-side mechanics.
//
// `shell` runs external binaries with timeouts; `drivers` are narrow
// facades over one mechanism each (ZFS, taps/firewall, jailer, reverse
// proxy, ssh keys, vsock RPC); `lifecycle` composes them into tenant
// operations; `reconcile` repairs drift; `bootstrap` validates the host.

pub mod bootstrap;
pub mod drivers;
pub mod gate;
pub mod lifecycle;
pub mod reconcile;
pub mod shell;
