// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Log on behalf of a route table. The table must have `log: Logger` and
/// `name: String` fields; `$module` is one of the `MOD_*` constants.
macro_rules! table_log {
    ($self:expr, $level:ident, $module:expr, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_RTPIPE,
            "module" => $module,
            "table" => $self.name.as_str(),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $module:expr, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_RTPIPE,
            "module" => $module,
            "table" => $self.name.as_str(),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $module:expr, $msg:expr) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_RTPIPE,
            "module" => $module,
            "table" => $self.name.as_str(),
        )
    };
    ($self:expr, $level:ident, $module:expr, $msg:expr, $($args:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_RTPIPE,
            "module" => $module,
            "table" => $self.name.as_str(),
        )
    };
}

macro_rules! pipeline_log {
    ($self:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_RTPIPE,
            "module" => crate::MOD_PIPELINE,
            "pipeline" => $self.name.as_str(),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_RTPIPE,
            "module" => crate::MOD_PIPELINE,
            "pipeline" => $self.name.as_str(),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_RTPIPE,
            "module" => crate::MOD_PIPELINE,
            "pipeline" => $self.name.as_str(),
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_RTPIPE,
            "module" => crate::MOD_PIPELINE,
            "pipeline" => $self.name.as_str(),
        )
    };
}

pub(crate) use pipeline_log;
pub(crate) use table_log;
