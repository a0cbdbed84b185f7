//! Execute transaction tests against the in-memory chain

mod mock_provider;

use alkanes_txbuilder::alkanes::execute::{create_execute_psbt, ExecuteParams};
use alkanes_txbuilder::alkanes::protostone::{
    decode_protostones, encipher_calldata, encode_protostone,
};
use alkanes_txbuilder::alkanes::{AlkanesManager, ProtostoneEdict, ProtostoneMessage};
use alkanes_txbuilder::signer::KeypairSigner;
use alkanes_txbuilder::transaction::{implied_fee, input_total, output_total, TxOptions};
use alkanes_txbuilder::utils::UnspentOutput;
use alkanes_txbuilder::AlkanesError;
use bitcoin::Amount;
use mock_provider::{
    assert_no_dust_outputs, legacy_utxo, provider, taproot_utxo, test_wallet, MockChain, TestWallet,
};
use std::sync::Arc;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn execute_params(
    alkanes_utxos: Vec<UnspentOutput>,
    utxos: Vec<UnspentOutput>,
    options: TxOptions,
) -> ExecuteParams {
    ExecuteParams {
        alkanes_utxos,
        utxos,
        protostone: encode_protostone(&ProtostoneMessage::new(vec![2, 1, 77])).unwrap(),
        options,
    }
}

fn rate(fee_rate: f64) -> TxOptions {
    TxOptions::default().with_fee_rate(fee_rate)
}

fn manager(chain: &Arc<MockChain>, wallet: &TestWallet) -> AlkanesManager {
    let signer = Arc::new(KeypairSigner::new(wallet.taproot_keypair));
    AlkanesManager::new(provider(chain), signer, wallet.account.clone())
}

fn frontend(wallet: &TestWallet, frontend_fee: u64) -> TxOptions {
    TxOptions {
        fee_rate: Some(1.0),
        frontend_fee,
        fee_address: Some(wallet.account.native_segwit.address.clone()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_execute_single_utxo() {
    init_logger();
    let chain = MockChain::new(1.0);
    let provider = provider(&chain);
    let wallet = test_wallet();

    let params = execute_params(vec![], vec![taproot_utxo(&wallet, 1, 100_000)], rate(1.0));
    let execute = create_execute_psbt(&params, &wallet.account, &provider).await.unwrap();

    let tx = &execute.psbt.unsigned_tx;
    assert_eq!(tx.input.len(), 1);
    assert_eq!(tx.output.len(), 3);
    assert_eq!(tx.output[0].value.to_sat(), 546);
    let taproot_script = wallet.account.taproot_address().unwrap().script_pubkey();
    assert_eq!(tx.output[0].script_pubkey, taproot_script);
    assert!(tx.output[1].script_pubkey.is_op_return());
    assert_eq!(tx.output[1].value, Amount::ZERO);
    let change_script = wallet.account.change_address().unwrap().script_pubkey();
    assert_eq!(tx.output[2].script_pubkey, change_script);

    assert!(execute.fee >= 250);
    assert_eq!(tx.output[2].value.to_sat(), 100_000 - 546 - execute.fee);
    assert_eq!(input_total(&execute.psbt).unwrap(), output_total(&execute.psbt) + execute.fee);
    assert_no_dust_outputs(&execute.psbt);
}

#[tokio::test]
async fn test_frontend_fee_without_address_is_rejected() {
    init_logger();
    let chain = MockChain::new(1.0);
    let provider = provider(&chain);
    let wallet = test_wallet();
    let utxos = vec![legacy_utxo(&chain, &wallet, 1, 100_000)];

    let options = TxOptions {
        fee_rate: Some(1.0),
        frontend_fee: 600,
        ..Default::default()
    };
    let params = execute_params(vec![], utxos, options);
    let result = create_execute_psbt(&params, &wallet.account, &provider).await;
    assert!(matches!(result, Err(AlkanesError::Configuration(_))));
    assert_eq!(chain.lookup_count(), 0);
}

#[tokio::test]
async fn test_frontend_fee_output() {
    init_logger();
    let chain = MockChain::new(1.0);
    let provider = provider(&chain);
    let wallet = test_wallet();

    let utxos = vec![taproot_utxo(&wallet, 1, 100_000)];
    let params = execute_params(vec![], utxos, frontend(&wallet, 600));
    let execute = create_execute_psbt(&params, &wallet.account, &provider).await.unwrap();

    let tx = &execute.psbt.unsigned_tx;
    assert_eq!(tx.output.len(), 4);
    assert_eq!(tx.output[2].value.to_sat(), 600);
    assert_eq!(
        tx.output[2].script_pubkey,
        wallet.account.change_address().unwrap().script_pubkey()
    );
    // 1018 WU with the extra output
    assert_eq!(execute.fee, 255);
    assert_eq!(tx.output[3].value.to_sat(), 100_000 - 546 - 600 - 255);
}

#[tokio::test]
async fn test_frontend_fee_below_relay_minimum_is_dropped() {
    init_logger();
    let chain = MockChain::new(1.0);
    let provider = provider(&chain);
    let wallet = test_wallet();

    let utxos = vec![taproot_utxo(&wallet, 1, 100_000)];
    let params = execute_params(vec![], utxos, frontend(&wallet, 300));
    let execute = create_execute_psbt(&params, &wallet.account, &provider).await.unwrap();

    let tx = &execute.psbt.unsigned_tx;
    assert_eq!(tx.output.len(), 3);
    assert_eq!(execute.fee, 250);
    assert_eq!(tx.output[2].value.to_sat(), 100_000 - 546 - 250);
    assert_no_dust_outputs(&execute.psbt);
}

#[tokio::test]
async fn test_alkanes_utxos_always_spent_first() {
    init_logger();
    let chain = MockChain::new(1.0);
    let provider = provider(&chain);
    let wallet = test_wallet();
    let alkanes_utxo = taproot_utxo(&wallet, 7, 546);
    let utxos = vec![
        alkanes_utxo.clone(),
        taproot_utxo(&wallet, 1, 100_000),
        taproot_utxo(&wallet, 2, 50_000),
    ];

    let params = execute_params(vec![alkanes_utxo.clone()], utxos, rate(1.0));
    let execute = create_execute_psbt(&params, &wallet.account, &provider).await.unwrap();

    let tx = &execute.psbt.unsigned_tx;
    assert_eq!(tx.input.len(), 2);
    assert_eq!(tx.input[0].previous_output, alkanes_utxo.outpoint().unwrap());
    assert_eq!(execute.fee, 250);
    assert_eq!(tx.output[2].value.to_sat(), 100_546 - 546 - 250);
}

#[tokio::test]
async fn test_execute_insufficient_balance() {
    init_logger();
    let chain = MockChain::new(1.0);
    let provider = provider(&chain);
    let wallet = test_wallet();

    let params = execute_params(vec![], vec![taproot_utxo(&wallet, 1, 700)], rate(1.0));
    let result = create_execute_psbt(&params, &wallet.account, &provider).await;
    assert!(matches!(
        result,
        Err(AlkanesError::InsufficientBalance { required: 796, available: 700 })
    ));
}

#[tokio::test]
async fn test_execute_folds_change_below_dust() {
    init_logger();
    let chain = MockChain::new(1.0);
    let provider = provider(&chain);
    let wallet = test_wallet();

    let params = execute_params(vec![], vec![taproot_utxo(&wallet, 1, 896)], rate(1.0));
    let execute = create_execute_psbt(&params, &wallet.account, &provider).await.unwrap();

    assert_eq!(execute.psbt.unsigned_tx.output.len(), 2);
    assert_eq!(execute.fee, 350);
    assert_eq!(implied_fee(&execute.psbt).unwrap(), 350);
    assert_no_dust_outputs(&execute.psbt);
}

#[tokio::test]
async fn test_execute_change_at_dust_boundary() {
    init_logger();
    let chain = MockChain::new(1.0);
    let provider = provider(&chain);
    let wallet = test_wallet();

    let params = execute_params(vec![], vec![taproot_utxo(&wallet, 1, 796 + 545)], rate(1.0));
    let execute = create_execute_psbt(&params, &wallet.account, &provider).await.unwrap();
    assert_eq!(execute.psbt.unsigned_tx.output.len(), 2);
    assert_eq!(execute.fee, 250 + 545);

    let params = execute_params(vec![], vec![taproot_utxo(&wallet, 1, 796 + 546)], rate(1.0));
    let execute = create_execute_psbt(&params, &wallet.account, &provider).await.unwrap();
    assert_eq!(execute.psbt.unsigned_tx.output.len(), 3);
    assert_eq!(execute.psbt.unsigned_tx.output[2].value.to_sat(), 546);
    assert_eq!(execute.fee, 250);
}

#[tokio::test]
async fn test_execute_recomputes_fee_for_selected_inputs() {
    init_logger();
    let chain = MockChain::new(1.0);
    let provider = provider(&chain);
    let wallet = test_wallet();
    let utxos: Vec<_> = (1..=5).map(|seed| taproot_utxo(&wallet, seed, 300)).collect();

    let params = execute_params(vec![], utxos, rate(1.0));
    let execute = create_execute_psbt(&params, &wallet.account, &provider).await.unwrap();

    // three inputs cover 796; the three-input fee is 269 and the 85 sat remainder is folded
    let tx = &execute.psbt.unsigned_tx;
    assert_eq!(tx.input.len(), 3);
    assert_eq!(tx.output.len(), 2);
    assert_eq!(execute.fee, 354);
}

#[tokio::test]
async fn test_execute_legacy_input_carries_previous_transaction() {
    init_logger();
    let chain = MockChain::new(1.0);
    let provider = provider(&chain);
    let wallet = test_wallet();
    let legacy = legacy_utxo(&chain, &wallet, 1, 20_000);

    let params = execute_params(vec![], vec![legacy.clone()], rate(1.0));
    let execute = create_execute_psbt(&params, &wallet.account, &provider).await.unwrap();

    let prev_tx = execute.psbt.inputs[0].non_witness_utxo.as_ref().unwrap();
    assert_eq!(prev_tx.compute_txid().to_string(), legacy.txid);
    assert_eq!(prev_tx.output[0].value.to_sat(), 20_000);
    assert_eq!(chain.lookup_count(), 1);
}

#[tokio::test]
async fn test_execute_is_deterministic() {
    init_logger();
    let chain = MockChain::new(1.0);
    let provider = provider(&chain);
    let wallet = test_wallet();

    let alkanes_utxos = vec![taproot_utxo(&wallet, 7, 546)];
    let params = execute_params(alkanes_utxos, vec![taproot_utxo(&wallet, 1, 30_000)], rate(4.0));
    let first = create_execute_psbt(&params, &wallet.account, &provider).await.unwrap();
    let second = create_execute_psbt(&params, &wallet.account, &provider).await.unwrap();
    assert_eq!(first.psbt.serialize(), second.psbt.serialize());
}

#[tokio::test]
async fn test_execute_psbt_uses_fee_rate_source() {
    init_logger();
    let chain = MockChain::new(3.0);
    let wallet = test_wallet();
    let manager = manager(&chain, &wallet);

    let utxos = vec![taproot_utxo(&wallet, 1, 100_000)];
    let params = execute_params(vec![], utxos, TxOptions::default());
    let execute = manager.execute_psbt(&params).await.unwrap();
    let estimate = manager.actual_execute_fee(&params).await.unwrap();

    assert_eq!(execute.fee, estimate.fee);
    assert!(estimate.fee >= 3 * estimate.vsize);
    assert_eq!(chain.broadcast_count(), 0);
}

#[tokio::test]
async fn test_execute_signs_and_broadcasts() {
    init_logger();
    let chain = MockChain::new(1.0);
    let wallet = test_wallet();
    let manager = manager(&chain, &wallet);

    let protostone = ProtostoneMessage {
        edicts: vec![ProtostoneEdict { block: 2, tx: 1, amount: 100, output: 0 }],
        ..ProtostoneMessage::new(vec![2, 1, 77])
    };
    let result = manager
        .execute(
            vec![taproot_utxo(&wallet, 7, 546)],
            vec![taproot_utxo(&wallet, 1, 100_000)],
            &protostone,
            TxOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(chain.broadcast_count(), 1);
    let tx = chain.broadcasted_txs.lock().unwrap()[0].clone();
    assert_eq!(tx.compute_txid().to_string(), result.broadcast.txid);
    assert!(tx.input.iter().all(|input| input.witness.len() == 1));

    let spent: u64 = 100_546;
    let paid: u64 = tx.output.iter().map(|output| output.value.to_sat()).sum();
    assert_eq!(spent - paid, result.fee.fee);

    let protostones = decode_protostones(&tx).unwrap();
    assert_eq!(protostones.len(), 1);
    assert!(protostones[0].message.starts_with(&encipher_calldata(&[2, 1, 77])));
    assert_eq!(protostones[0].edicts.len(), 1);
}

#[tokio::test]
async fn test_execute_reports_folded_change_as_fee() {
    init_logger();
    let chain = MockChain::new(1.0);
    let wallet = test_wallet();
    let manager = manager(&chain, &wallet);

    // 1_000 - 546 - 250 leaves 204 sats of change, below dust
    let result = manager
        .execute(
            vec![],
            vec![taproot_utxo(&wallet, 1, 1_000)],
            &ProtostoneMessage::new(vec![2, 1, 77]),
            TxOptions::default(),
        )
        .await
        .unwrap();

    let tx = chain.broadcasted_txs.lock().unwrap()[0].clone();
    assert_eq!(tx.output.len(), 2);
    let paid: u64 = tx.output.iter().map(|output| output.value.to_sat()).sum();
    assert_eq!(1_000 - paid, result.fee.fee);
    assert_eq!(result.fee.fee, 454);
}
