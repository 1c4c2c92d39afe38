mod common;

use readmodel_testing::contract::{
    checkpoint_store_contract_tests, document_store_contract_tests, event_log_contract_tests,
};

event_log_contract_tests! {
    #[ignore = "requires Docker"]
    suite = postgres_event_log,
    make_store = || crate::common::make_store(),
}

checkpoint_store_contract_tests! {
    #[ignore = "requires Docker"]
    suite = postgres_checkpoints,
    make_store = || crate::common::make_store(),
}

document_store_contract_tests! {
    #[ignore = "requires Docker"]
    suite = postgres_documents,
    make_store = || crate::common::make_store(),
}
