fn main() {
    // ESP-IDF build configuration
    embuild::espidf::sysenv::output();

    // Wi-Fi credentials are baked in at build time
    println!("cargo:rerun-if-env-changed=WIFI_SSID");
    println!("cargo:rerun-if-env-changed=WIFI_PASS");

    println!("cargo:rerun-if-changed=lifecycle.ron");
    println!("cargo:rerun-if-changed=build.rs");
}
