//! Host-side transport

mod reqwest_client;

pub use reqwest_client::ReqwestHttp;
