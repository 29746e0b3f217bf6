pub mod cri_proto {
    tonic::include_proto!("cri.v1");
}
