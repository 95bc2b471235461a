//! API-set name redirection.
//!
//! Windows virtualizes many DLL names (`api-ms-win-core-...`) onto
//! concrete provider DLLs via a per-process schema. The analyzer does not
//! carry the schema database; it consults one through `ApiSetSchema` and
//! rewrites import library names and export forward strings accordingly.

/// Query interface onto the API-set schema database.
///
/// `resolve` answers: for `consumer` importing (or forwarding into)
/// `provider` (extension already stripped), which concrete library
/// services the contract? `None` means no redirection applies.
pub trait ApiSetSchema {
    fn resolve(&self, consumer: &str, provider: &str) -> Option<String>;
}

/// Schema that redirects nothing.
pub struct NullSchema;

impl ApiSetSchema for NullSchema {
    fn resolve(&self, _consumer: &str, _provider: &str) -> Option<String> {
        None
    }
}

/// `"kernel32.dll"` -> `"kernel32"`; leaves dotless names alone.
pub fn strip_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _ext)) => stem,
        None => name,
    }
}

/// Apply API-set redirection to an import library name.
/// Returns the concrete library, or the original name unchanged.
pub fn redirect_library(schema: &dyn ApiSetSchema, consumer: &str, library: &str) -> String {
    match schema.resolve(consumer, strip_extension(library)) {
        Some(target) => target,
        None => library.to_string(),
    }
}

/// Apply API-set redirection to an export forward string
/// (`"library.function"`, possibly with further dots inside the library
/// part). The function name is kept; only the library portion may change.
pub fn redirect_forward(schema: &dyn ApiSetSchema, consumer: &str, forward: &str) -> String {
    let (library, function) = match forward.rsplit_once('.') {
        Some(parts) => parts,
        // not a library.function shape; nothing to redirect.
        None => return forward.to_string(),
    };

    match schema.resolve(consumer, strip_extension(library)) {
        Some(target) => format!("{}.{}", strip_extension(&target), function),
        None => forward.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    pub struct MapSchema {
        pub map: HashMap<String, String>,
    }

    impl ApiSetSchema for MapSchema {
        fn resolve(&self, _consumer: &str, provider: &str) -> Option<String> {
            self.map.get(provider).cloned()
        }
    }

    fn schema() -> MapSchema {
        let mut map = HashMap::new();
        map.insert(
            "api-ms-win-core-libraryloader-l1-1-0".to_string(),
            "kernelbase.dll".to_string(),
        );
        MapSchema { map }
    }

    #[test]
    fn library() {
        let s = schema();
        assert_eq!(
            redirect_library(&s, "kernel32.dll", "api-ms-win-core-libraryloader-l1-1-0.dll"),
            "kernelbase.dll"
        );
        assert_eq!(redirect_library(&s, "kernel32.dll", "ntdll.dll"), "ntdll.dll");
    }

    #[test]
    fn forward() {
        let s = schema();
        assert_eq!(
            redirect_forward(
                &s,
                "kernel32.dll",
                "api-ms-win-core-libraryloader-l1-1-0.GetModuleFileNameW"
            ),
            "kernelbase.GetModuleFileNameW"
        );
        // untouched when the schema has no entry.
        assert_eq!(
            redirect_forward(&s, "kernel32.dll", "ntdll.RtlAllocateHeap"),
            "ntdll.RtlAllocateHeap"
        );
        // forward libraries may themselves contain dots;
        // only the last component is the function.
        assert_eq!(
            redirect_forward(&s, "kernel32.dll", "KERNEL.APPCORE.IsDeveloperModeEnabled"),
            "KERNEL.APPCORE.IsDeveloperModeEnabled"
        );
    }
}
