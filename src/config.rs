//! The configuration object the driver hands to a translation: output
//! syntax, TLS/PIC mode, frame-pointer policy, debug info, and the pipeline
//! spec. Modelled after the builder cranelift's `settings` module uses for
//! its `Flags`, trimmed to the handful of knobs this backend actually reads.

/// Target assembly syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    X86_64IntelPrefix,
    X86_64IntelNoPrefix,
    X86_64Att,
}

/// Translation-wide configuration, immutable once built.
#[derive(Debug, Clone)]
pub struct Config {
    pub syntax: Syntax,
    pub emulated_tls: bool,
    pub position_independent_code: bool,
    pub omit_frame_pointer: bool,
    pub debug_info: bool,
    pub pipeline_spec: Vec<String>,
    pub runtime_function_generator_mode: bool,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for [`Config`]; separated out so callers can set fields by name
/// without a dozen-argument constructor, mirroring the `Configurable`
/// pattern cranelift's ISA `Builder` uses for shared/ISA-specific settings.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    syntax: Syntax,
    emulated_tls: bool,
    position_independent_code: bool,
    omit_frame_pointer: bool,
    debug_info: bool,
    pipeline_spec: Vec<String>,
    runtime_function_generator_mode: bool,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        ConfigBuilder {
            syntax: Syntax::X86_64Att,
            emulated_tls: false,
            position_independent_code: false,
            omit_frame_pointer: false,
            debug_info: false,
            pipeline_spec: Vec::new(),
            runtime_function_generator_mode: false,
        }
    }
}

impl ConfigBuilder {
    pub fn syntax(mut self, syntax: Syntax) -> Self {
        self.syntax = syntax;
        self
    }

    pub fn emulated_tls(mut self, v: bool) -> Self {
        self.emulated_tls = v;
        self
    }

    pub fn position_independent_code(mut self, v: bool) -> Self {
        self.position_independent_code = v;
        self
    }

    pub fn omit_frame_pointer(mut self, v: bool) -> Self {
        self.omit_frame_pointer = v;
        self
    }

    pub fn debug_info(mut self, v: bool) -> Self {
        self.debug_info = v;
        self
    }

    pub fn pipeline_spec(mut self, spec: &str) -> Self {
        self.pipeline_spec = spec.split(',').map(|s| s.trim().to_string()).collect();
        self
    }

    pub fn runtime_function_generator_mode(mut self, v: bool) -> Self {
        self.runtime_function_generator_mode = v;
        self
    }

    pub fn build(self) -> Config {
        Config {
            syntax: self.syntax,
            emulated_tls: self.emulated_tls,
            position_independent_code: self.position_independent_code,
            omit_frame_pointer: self.omit_frame_pointer,
            debug_info: self.debug_info,
            pipeline_spec: self.pipeline_spec,
            runtime_function_generator_mode: self.runtime_function_generator_mode,
        }
    }
}
