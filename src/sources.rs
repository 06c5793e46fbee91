use crate::traits::{Connector, ConnectorRegistry};

/// Print one line per configured connector instance.
pub fn list_sources(registry: &ConnectorRegistry) {
    println!(
        "{:<20} {:<10} {:<12} {:<8} BASE URL",
        "SOURCE", "TYPE", "RATE LIMIT", "AUTH"
    );
    if registry.is_empty() {
        println!("(no connectors configured)");
        return;
    }
    for connector in registry.connectors() {
        println!("{}", source_row(connector.as_ref()));
    }
}

fn source_row(connector: &dyn Connector) -> String {
    let config = connector.config();
    let rate = format!(
        "{}/{}s",
        config.requests_per_window,
        config.window.as_secs()
    );
    let auth = if config.api_key.is_some() { "key" } else { "none" };
    format!(
        "{:<20} {:<10} {:<12} {:<8} {}",
        connector.source_label(),
        connector.connector_type(),
        rate,
        auth,
        config.base_url
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn row_shows_type_defaults() {
        let cfg: Config = toml::from_str("[connectors.ine.es]\n").unwrap();
        let registry = ConnectorRegistry::from_config(&cfg).unwrap();
        let row = source_row(registry.connectors()[0].as_ref());
        assert!(row.starts_with("ine:es"));
        assert!(row.contains("100/60s"));
        assert!(row.contains("https://servicios.ine.es/wstempus/js/ES"));
    }
}
