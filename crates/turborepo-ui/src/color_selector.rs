use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use console::{Style, StyledObject};

/// Hands out a stable color per key (task id). The same key always gets
/// the same color within a run, so interleaved output stays readable.
#[derive(Debug, Clone, Default)]
pub struct ColorSelector {
    inner: Arc<RwLock<ColorSelectorState>>,
}

#[derive(Debug, Default)]
struct ColorSelectorState {
    idx: usize,
    cache: HashMap<String, Style>,
}

fn color_palette() -> [Style; 5] {
    [
        Style::new().cyan(),
        Style::new().magenta(),
        Style::new().green(),
        Style::new().yellow(),
        Style::new().blue(),
    ]
}

impl ColorSelector {
    pub fn color_for_key(&self, key: &str) -> Style {
        if let Some(style) = self.inner.read().expect("lock poisoned").cache.get(key) {
            return style.clone();
        }

        let mut state = self.inner.write().expect("lock poisoned");
        // Another writer may have raced us here; entry keeps it stable.
        let idx = state.idx;
        let style = state
            .cache
            .entry(key.to_string())
            .or_insert_with(|| {
                let palette = color_palette();
                palette[idx % palette.len()].clone()
            })
            .clone();
        state.idx += 1;
        style
    }

    pub fn prefix_with_color(&self, key: &str, prefix: &str) -> StyledObject<String> {
        if prefix.is_empty() {
            return Style::new().apply_to(String::new());
        }
        self.color_for_key(key).apply_to(format!("{prefix}: "))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_color_is_stable_per_key() {
        let selector = ColorSelector::default();
        let first = selector.color_for_key("web#build");
        let again = selector.color_for_key("web#build");
        assert_eq!(format!("{:?}", first), format!("{:?}", again));
    }

    #[test]
    fn test_different_keys_rotate() {
        let selector = ColorSelector::default();
        let a = selector.color_for_key("a");
        let b = selector.color_for_key("b");
        assert_ne!(format!("{:?}", a), format!("{:?}", b));
    }

    #[test]
    fn test_concurrent_access_is_consistent() {
        let selector = ColorSelector::default();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let selector = selector.clone();
                scope.spawn(move || {
                    for key in ["a", "b", "c"] {
                        selector.color_for_key(key);
                    }
                });
            }
        });
        // all threads observed a single stable assignment
        let a = selector.color_for_key("a");
        assert_eq!(format!("{:?}", a), format!("{:?}", selector.color_for_key("a")));
    }
}
