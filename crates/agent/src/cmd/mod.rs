#[cfg(unix)]
mod install;
mod status;
mod unpair;

#[cfg(unix)]
pub use install::install;
pub use status::status;
pub use unpair::unpair;
