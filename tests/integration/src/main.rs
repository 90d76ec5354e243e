mod helpers;

mod auth;
mod cluster;
mod persistence;
