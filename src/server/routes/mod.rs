pub mod instances;
pub mod mcp;
pub mod oauth;
pub mod webhooks;
