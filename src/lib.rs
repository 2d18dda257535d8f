//! Grafana Loki MCP 工具核心库
//! 查询参数解析、URL 构造、后端调用与结果格式化各自独立成模块。

pub mod config;
pub mod error;
pub mod model;
pub mod timeexpr;
pub mod endpoint;
pub mod backend;
pub mod format;
pub mod tools;
pub mod mcp;
pub mod http;
