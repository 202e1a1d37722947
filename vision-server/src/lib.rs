// 视觉流服务库
//
// 采集源 -> 实时流转发 -> 浏览器，以及经由 Ollama 的图像/文本推理。

pub mod auth;
pub mod capture;
pub mod config;
pub mod http;
pub mod hub;
pub mod inference;
pub mod registry;
pub mod serde_helpers;
