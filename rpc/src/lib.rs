#[allow(dead_code)]
#[allow(clippy::type_complexity)]
#[allow(clippy::unit_arg)]
#[allow(clippy::redundant_closure)]
pub mod mayastor {

    impl From<()> for Null {
        fn from(_: ()) -> Self {
            Self {}
        }
    }

    include!(concat!(env!("OUT_DIR"), "/mayastor.rs"));
}

#[allow(clippy::type_complexity)]
#[allow(clippy::large_enum_variant)]
pub mod csi {
    include!(concat!(env!("OUT_DIR"), "/csi.v1.rs"));
}
