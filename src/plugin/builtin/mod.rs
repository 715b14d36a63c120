//! Compiled-in plugin table.

pub mod demo;
pub mod linear;
pub mod stocks;

use super::registry::StaticPluginSource;

const DEMO_UNIT: &str = "forge-demo";
const STOCKS_UNIT: &str = "forge-stocks";

/// The plugins shipped with the worker. `demo` ships no form schema.
pub fn source() -> StaticPluginSource {
    StaticPluginSource::new()
        .with_pipeline(demo::NAME, DEMO_UNIT, demo::factory)
        .with_config_provider(demo::NAME, demo::default_config)
        .with_pipeline(stocks::NAME, STOCKS_UNIT, stocks::factory)
        .with_config_provider(stocks::NAME, stocks::default_config)
        .with_form_schema(
            STOCKS_UNIT,
            include_str!("../../../resources/schemas/stocks.form.json"),
        )
}
