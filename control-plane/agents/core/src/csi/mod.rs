pub(crate) mod controller;
pub(crate) mod identity;
mod server;

pub(crate) use server::CsiServer;
