/// Foreground/background state reported by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppLifecycle {
    #[default]
    Active,
    Inactive,
    Background,
}

impl AppLifecycle {
    pub fn is_backgrounded(self) -> bool {
        matches!(self, AppLifecycle::Inactive | AppLifecycle::Background)
    }

    /// True for an inactive/background → active transition.
    pub fn is_foregrounding(previous: AppLifecycle, next: AppLifecycle) -> bool {
        previous.is_backgrounded() && next == AppLifecycle::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_background_to_active_counts_as_foregrounding() {
        use AppLifecycle::*;
        assert!(AppLifecycle::is_foregrounding(Background, Active));
        assert!(AppLifecycle::is_foregrounding(Inactive, Active));
        assert!(!AppLifecycle::is_foregrounding(Active, Active));
        assert!(!AppLifecycle::is_foregrounding(Active, Background));
        assert!(!AppLifecycle::is_foregrounding(Background, Inactive));
    }
}
