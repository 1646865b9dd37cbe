//! Fee policy: the aggregator cost a batch must cover, the response fee
//! limit passed to task creation, and the non-paying payer rewrite.

use alloy_primitives::{Address, U256};

/// Cost of the aggregator's signature-aggregation response, priced at the
/// current gas price and scaled by the configured percentage multiplier.
pub fn aggregator_fee(gas_price: U256, aggregator_gas_cost: u64, multiplier_percent: u64) -> U256 {
    gas_price * U256::from(aggregator_gas_cost) * U256::from(multiplier_percent) / U256::from(100)
}

/// `respondToTaskFeeLimit`: a configured multiple of the estimated response
/// gas at the current gas price.
pub fn respond_to_task_fee_limit(
    gas_price: U256,
    aggregator_gas_cost: u64,
    multiplier: u64,
) -> U256 {
    gas_price * U256::from(aggregator_gas_cost) * U256::from(multiplier)
}

/// A sealed batch must cover the aggregator cost with margin:
/// `fee_per_proof × entries > aggregator_fee + margin`.
pub fn covers_aggregator_cost(
    fee_per_proof: U256,
    entry_count: usize,
    aggregator_fee: U256,
    margin: U256,
) -> bool {
    fee_per_proof * U256::from(entry_count) > aggregator_fee + margin
}

/// Billing substitution for a designated non-paying submitter: fees are
/// debited from a batcher-held replacement account instead. This is a pure
/// payer rewrite applied at ingress and when the task's submitter list is
/// built; the Merkle leaf keeps the original `proof_generator_addr`.
#[derive(Debug, Clone, Copy)]
pub struct NonPayingPolicy {
    pub address: Address,
    pub replacement: Address,
}

impl NonPayingPolicy {
    pub fn payer_for(policy: Option<&Self>, submitter: Address) -> Address {
        match policy {
            Some(p) if p.address == submitter => p.replacement,
            _ => submitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregator_fee_scales_with_multiplier() {
        let fee = aggregator_fee(U256::from(10), 100_000, 125);
        assert_eq!(fee, U256::from(1_250_000));
    }

    #[test]
    fn margin_check_is_strict() {
        let agg = U256::from(1_000);
        // 10 entries × 101 = 1010 > 1000 + 0
        assert!(covers_aggregator_cost(U256::from(101), 10, agg, U256::ZERO));
        // exactly equal is not enough
        assert!(!covers_aggregator_cost(U256::from(100), 10, agg, U256::ZERO));
        // margin pushes the bar up
        assert!(!covers_aggregator_cost(
            U256::from(101),
            10,
            agg,
            U256::from(10)
        ));
    }

    #[test]
    fn non_paying_rewrite_only_touches_the_designated_address() {
        let policy = NonPayingPolicy {
            address: Address::repeat_byte(0x01),
            replacement: Address::repeat_byte(0x02),
        };
        assert_eq!(
            NonPayingPolicy::payer_for(Some(&policy), Address::repeat_byte(0x01)),
            Address::repeat_byte(0x02)
        );
        let other = Address::repeat_byte(0x03);
        assert_eq!(NonPayingPolicy::payer_for(Some(&policy), other), other);
        assert_eq!(NonPayingPolicy::payer_for(None, other), other);
    }
}
