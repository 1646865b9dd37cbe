//! On-chain surface the batcher consumes: the payment service it creates
//! tasks through and reads balances from, and the service manager's
//! disabled-verifier registry.

use alloy_sol_types::sol;

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract BatcherPaymentService {
        function createNewTask(
            bytes32 batchMerkleRoot,
            string batchDataPointer,
            address[] proofSubmitters,
            uint256 feeForAggregator,
            uint256 feePerProof,
            uint256 respondToTaskFeeLimit
        ) external;

        function user_balances(address account) external view returns (uint256);
        function user_nonces(address account) external view returns (uint256);
        function user_unlock_block(address account) external view returns (uint256);

        event BatcherBalanceUpdated(address indexed user, uint256 newBalance);
        event BalanceLocked(address indexed user);
        event BalanceUnlocked(address indexed user, uint256 unlockBlock);
        event NewBatchV3(
            bytes32 indexed batchMerkleRoot,
            address senderAddress,
            uint32 taskCreatedBlock,
            string batchDataPointer,
            uint256 respondToTaskFeeLimit
        );
        event BatchVerified(bytes32 indexed batchMerkleRoot);
    }
}

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract AlignedServiceManager {
        function isVerifierDisabled(uint8 verifierIdx) external view returns (bool);

        event VerifierDisabled(uint8 indexed verifierIdx);
        event VerifierEnabled(uint8 indexed verifierIdx);
    }
}
