use cfg_aliases::cfg_aliases;

fn main() {
    cfg_aliases! {
        android: { target_os = "android" },
        linux: { all(target_os = "linux", not(target_os = "android")) },
        linux_android: { any(target_os = "linux", target_os = "android") },
        apple: { any(target_os = "macos", target_os = "ios") },
    }
}
