// 基础设施：配置、错误分类与退出信号。
pub mod config;
pub mod error;
pub mod shutdown;
