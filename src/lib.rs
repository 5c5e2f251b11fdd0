pub mod cache;
pub mod config;
pub mod drive;
pub mod emby;
pub mod errors;
pub mod http_client;
pub mod listener;
pub mod path;
pub mod playlist;
pub mod route;
pub mod util;
pub mod web;
