/// Info log from workflow code, silent while the execution is replaying.
///
/// ```rust,ignore
/// workflow_info!(ctx, order_id = %id, "order accepted");
/// ```
#[macro_export]
macro_rules! workflow_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            $crate::__tracing::info!(workflow_type = $ctx.workflow_type(), now_ms = $ctx.now_ms(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! workflow_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            $crate::__tracing::warn!(workflow_type = $ctx.workflow_type(), now_ms = $ctx.now_ms(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! workflow_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            $crate::__tracing::error!(workflow_type = $ctx.workflow_type(), now_ms = $ctx.now_ms(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! workflow_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            $crate::__tracing::debug!(workflow_type = $ctx.workflow_type(), now_ms = $ctx.now_ms(), $($arg)+);
        }
    }};
}
