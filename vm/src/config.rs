/// Output mode of a session, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Live in-process addresses, usable immediately.
    Dynamic,
    /// Relocatable cells collected into a persistable module.
    #[value(name = "aot")]
    AheadOfTime,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: Mode,
    /// Busy-wait iterations before a contended thin lock starts yielding.
    pub spin_limit: u32,
    /// Maximum number of live fat monitors.
    pub monitor_capacity: usize,
    /// Upper bound on emitted cells in ahead-of-time mode.
    pub max_cells: Option<usize>,
    /// Class whose pointer is stored in the header of string constants.
    pub string_class: String,
    /// Name recorded in ahead-of-time modules and their loader symbol.
    pub module_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Dynamic,
            spin_limit: 64,
            monitor_capacity: 1 << 16,
            max_cells: None,
            string_class: "java/lang/String".to_string(),
            module_name: "main".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn dynamic() -> Self {
        Self::default()
    }

    pub fn ahead_of_time(module_name: &str) -> Self {
        Self {
            mode: Mode::AheadOfTime,
            module_name: module_name.to_string(),
            ..Self::default()
        }
    }
}
