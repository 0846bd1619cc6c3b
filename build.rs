fn main() {
    println!("cargo:rerun-if-changed=keys/update_signing_pub.pem");

    #[cfg(feature = "espidf")]
    embuild::espidf::sysenv::output();
}
