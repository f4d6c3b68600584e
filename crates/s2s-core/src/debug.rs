//! Вспомогательные функции для отладочного вывода.

use std::sync::OnceLock;

/// Возвращает `true`, если включен подробный отладочный вывод.
///
/// Управляется переменной окружения `S2S_DEBUG` (любое непустое значение).
pub fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("S2S_DEBUG").is_some_and(|v| !v.is_empty()))
}
