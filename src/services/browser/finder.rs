use std::path::{Path, PathBuf};

/// 查找Chromium可执行文件，优先使用显式配置的路径
pub fn find_chromium(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return resolve(path);
    }

    candidates().iter().find_map(|candidate| resolve(candidate))
}

fn resolve(candidate: &str) -> Option<PathBuf> {
    let looks_like_path = candidate.contains('/') || candidate.contains('\\');
    if looks_like_path {
        let path = Path::new(candidate);
        return path.exists().then(|| path.to_path_buf());
    }
    which::which(candidate).ok()
}

fn candidates() -> Vec<String> {
    let list: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
            "chrome.exe",
            "msedge.exe",
        ]
    } else {
        &[
            "chromium",
            "chromium-browser",
            "google-chrome-stable",
            "google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/bin/google-chrome",
            "/snap/bin/chromium",
        ]
    };

    list.iter().map(|s| s.to_string()).collect()
}
