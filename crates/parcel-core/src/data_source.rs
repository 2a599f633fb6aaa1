//! Config-gated data sources
//!
//! A data source is either disabled or enabled with a live instance. The only
//! transition function is [`GatedDataSource::on_config_change`], which creates
//! the instance when the gate opens and tears it down when it closes.

use tracing::debug;

use crate::config::Config;

/// Current state of a gated data source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSourceState<T> {
    Disabled,
    Enabled(T),
}

impl<T> DataSourceState<T> {
    pub fn is_enabled(&self) -> bool {
        matches!(self, DataSourceState::Enabled(_))
    }

    pub fn instance(&self) -> Option<&T> {
        match self {
            DataSourceState::Enabled(instance) => Some(instance),
            DataSourceState::Disabled => None,
        }
    }
}

/// An instance that must release resources when its gate closes
pub trait DataSource: Send {
    fn disable(&mut self);
}

type Factory<T> = Box<dyn FnMut(&Config) -> T + Send>;
type Gate = Box<dyn Fn(&Config) -> bool + Send + Sync>;

/// A data source whose lifetime follows a configuration predicate
pub struct GatedDataSource<T: DataSource> {
    name: &'static str,
    state: DataSourceState<T>,
    factory: Factory<T>,
    gate: Gate,
}

impl<T: DataSource> GatedDataSource<T> {
    /// Creates a disabled data source. Call
    /// [`on_config_change`](Self::on_config_change) to evaluate the gate.
    pub fn new(
        name: &'static str,
        gate: impl Fn(&Config) -> bool + Send + Sync + 'static,
        factory: impl FnMut(&Config) -> T + Send + 'static,
    ) -> Self {
        Self {
            name,
            state: DataSourceState::Disabled,
            factory: Box::new(factory),
            gate: Box::new(gate),
        }
    }

    pub fn state(&self) -> &DataSourceState<T> {
        &self.state
    }

    /// Re-evaluates the gate against `config`
    ///
    /// Disabled -> Enabled creates an instance; Enabled -> Disabled calls
    /// [`DataSource::disable`]. Other transitions leave the state untouched.
    pub fn on_config_change(&mut self, config: &Config) {
        let should_enable = (self.gate)(config);
        match (self.state.is_enabled(), should_enable) {
            (false, true) => {
                debug!(data_source = self.name, "Enabling data source");
                self.state = DataSourceState::Enabled((self.factory)(config));
            }
            (true, false) => {
                debug!(data_source = self.name, "Disabling data source");
                self.disable();
            }
            _ => {}
        }
    }

    /// Disables the data source regardless of configuration
    pub fn disable(&mut self) {
        if let DataSourceState::Enabled(instance) = &mut self.state {
            instance.disable();
        }
        self.state = DataSourceState::Disabled;
    }
}

impl<T: DataSource> std::fmt::Debug for GatedDataSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatedDataSource")
            .field("name", &self.name)
            .field("enabled", &self.state.is_enabled())
            .finish()
    }
}
