use readmodel_memory::InMemoryStore;
use readmodel_testing::contract::{
    checkpoint_store_contract_tests, document_store_contract_tests, event_log_contract_tests,
};

event_log_contract_tests! {
    suite = in_memory_event_log,
    make_store = || async { InMemoryStore::new() },
}

checkpoint_store_contract_tests! {
    suite = in_memory_checkpoints,
    make_store = || async { InMemoryStore::new() },
}

document_store_contract_tests! {
    suite = in_memory_documents,
    make_store = || async { InMemoryStore::new() },
}
