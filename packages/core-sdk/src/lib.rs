pub mod config;
pub mod edit;
pub mod llm;
pub mod models;
pub mod sandbox;
pub mod schema;
pub mod secrets;
pub mod server;
pub mod telemetry;
pub mod templates;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config;
    pub use crate::edit;
    pub use crate::llm;
    pub use crate::models;
    pub use crate::sandbox;
    pub use crate::schema;
    pub use crate::secrets;
    pub use crate::server;
    pub use crate::telemetry;
    pub use crate::templates;
}
