use std::fmt;

/// Anything that can log a formatted warning.
pub trait Warner {
    fn warning(&self, args: fmt::Arguments<'_>);
}

impl<W: Warner + ?Sized> Warner for &W {
    fn warning(&self, args: fmt::Arguments<'_>) {
        (**self).warning(args)
    }
}

impl<W: Warner + ?Sized> Warner for std::sync::Arc<W> {
    fn warning(&self, args: fmt::Arguments<'_>) {
        (**self).warning(args)
    }
}

/// Forwards warnings to the `log` facade at warn level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogWarner;

impl Warner for LogWarner {
    fn warning(&self, args: fmt::Arguments<'_>) {
        log::warn!(target: "schedprobe", "{}", args);
    }
}
